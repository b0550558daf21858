//! Mock LLM 客户端（用于测试与未配置 Key 的本地运行，无需 API）
//!
//! 识别商家模拟 prompt 中的 `Question type:` 与 `Customer budget:`，返回固定格式的 JSON 回复；
//! 其他 prompt（如评价抽取）返回空 JSON 列表。

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// Mock 客户端：月费 2500，始终可预约
#[derive(Debug, Default)]
pub struct MockLlmClient;

fn field_after<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix(label))
        .map(str::trim)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let Some(question) = field_after(last_user, "Question type:") else {
            return Ok("[]".to_string());
        };

        Ok(serde_json::json!({
            "response_type": question,
            "message": format!("Mock reply about {question}."),
            "pricing_info": {"monthly": 2500, "quarterly": 7000},
            "available": true,
            "features": ["cardio", "weights"],
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_answers_simulation_prompt() {
        let out = MockLlmClient
            .complete_prompt("Generate a response\nQuestion type: pricing\nNo budget mentioned")
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["response_type"], "pricing");
        assert_eq!(v["pricing_info"]["monthly"], 2500);
    }

    #[tokio::test]
    async fn test_mock_other_prompts_return_empty_list() {
        let out = MockLlmClient.complete_prompt("extract reviews").await.unwrap();
        assert_eq!(out, "[]");
    }
}
