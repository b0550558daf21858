//! contact_shop_simulation：用 LLM 模拟商家对咨询的回复
//!
//! 模型被要求输出 JSON `{response_type, message, pricing_info, available, features}`；
//! 调用失败或输出无法解析时返回预设回复（`fallback: true`），保证 Reflexion 循环总有可评估的值。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{Tool, CONTACT_SHOP_TOOL};

#[derive(Debug, Deserialize)]
struct ContactShopArgs {
    place_name: String,
    place_type: String,
    question_type: String,
    #[serde(default)]
    user_budget: Option<f64>,
}

pub struct ShopContactTool {
    llm: Arc<dyn LlmClient>,
}

impl ShopContactTool {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_messages(args: &ContactShopArgs) -> Vec<Message> {
        let system = format!(
            "You are simulating a {} business owner/manager responding to a customer inquiry.\n\
             Business name: {}\n\
             Be professional, realistic, and provide specific details.",
            args.place_type, args.place_name
        );
        let budget_line = match args.user_budget {
            Some(b) => format!("Customer budget: ₹{b}"),
            None => "No budget mentioned".to_string(),
        };
        let user = format!(
            "Generate a realistic response for this inquiry:\n\n\
             Question type: {q}\n\
             {budget_line}\n\n\
             Provide response in this JSON format:\n\
             {{\n\
             \"response_type\": \"{q}\",\n\
             \"message\": \"Your detailed response here\",\n\
             \"pricing_info\": {{\"monthly\": 3000, \"quarterly\": 8000}} (if applicable),\n\
             \"available\": true/false,\n\
             \"features\": [\"feature1\", \"feature2\"] (if applicable)\n\
             }}",
            q = args.question_type
        );
        vec![Message::system(system), Message::user(user)]
    }
}

/// 预设回复
pub fn fallback_response(question_type: &str) -> Value {
    json!({
        "response_type": question_type,
        "message": format!("We'd be happy to help! Please call us for details about {question_type}."),
        "pricing_info": null,
        "available": true,
        "features": [],
        "fallback": true,
    })
}

/// 提取 JSON 块（```json ... ``` 或首个 { 到最后一个 }）
fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// "₹3,000" / "3000" / 3000 都解析为 3000.0
fn parse_amount(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// 解析并规范化模型输出；缺少 message 视为无法解析
pub fn parse_simulated_response(text: &str, question_type: &str) -> Option<Value> {
    let raw: Value = serde_json::from_str(extract_json_block(text)?).ok()?;
    let obj = raw.as_object()?;
    let message = obj.get("message")?.as_str()?.to_string();

    let pricing_info = obj
        .get("pricing_info")
        .and_then(Value::as_object)
        .map(|info| {
            info.iter()
                .filter_map(|(k, v)| parse_amount(v).map(|p| (k.clone(), json!(p))))
                .collect::<Map<String, Value>>()
        })
        .filter(|m| !m.is_empty())
        .map(Value::Object)
        .unwrap_or(Value::Null);

    let available = match obj.get("available") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !matches!(s.to_lowercase().as_str(), "false" | "no"),
        _ => true,
    };
    let features: Vec<Value> = obj
        .get("features")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter(|f| f.is_string()).cloned().collect())
        .unwrap_or_default();

    Some(json!({
        "response_type": obj.get("response_type").and_then(Value::as_str).unwrap_or(question_type),
        "message": message,
        "pricing_info": pricing_info,
        "available": available,
        "features": features,
        "fallback": false,
    }))
}

#[async_trait]
impl Tool for ShopContactTool {
    fn name(&self) -> &str {
        CONTACT_SHOP_TOOL
    }

    fn description(&self) -> &str {
        "Simulate contacting a business. Args: {\"place_name\", \"place_type\", \"question_type\": pricing|availability|features|negotiation, \"user_budget\": optional}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "place_name": {"type": "string"},
                "place_type": {"type": "string"},
                "question_type": {"type": "string"},
                "user_budget": {"type": "number"}
            },
            "required": ["place_name", "place_type", "question_type"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: ContactShopArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid args: {e}"))?;
        let messages = Self::build_messages(&args);
        match self.llm.complete(&messages).await {
            Ok(text) => Ok(parse_simulated_response(&text, &args.question_type).unwrap_or_else(
                || {
                    tracing::warn!(place = %args.place_name, "unparseable simulation output, using fallback");
                    fallback_response(&args.question_type)
                },
            )),
            Err(e) => {
                tracing::warn!(place = %args.place_name, error = %e, "simulation provider unavailable, using fallback");
                Ok(fallback_response(&args.question_type))
            }
        }
    }
}
