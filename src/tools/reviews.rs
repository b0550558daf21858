//! search_reviews：Tavily 评价搜索
//!
//! 未配置 Key 时返回 `{"source": "fallback", ...}`；请求失败返回 `{"source": "error", "error": ...}`，
//! 两者都不会让工作流中断。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{configured, TavilySection};
use crate::tools::{Tool, SEARCH_REVIEWS_TOOL};

#[derive(Debug, Deserialize)]
struct SearchReviewsArgs {
    place_name: String,
    city: String,
}

pub struct ReviewSearchTool {
    client: Client,
    cfg: TavilySection,
}

impl ReviewSearchTool {
    pub fn new(cfg: TavilySection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, cfg }
    }

    async fn search(&self, api_key: &str, args: &SearchReviewsArgs) -> Result<Value, String> {
        let query = format!(
            "{} {} reviews ratings customer feedback",
            args.place_name, args.city
        );
        let resp = self
            .client
            .post(&self.cfg.api_url)
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": self.cfg.max_results,
                "search_depth": "advanced",
                "include_answer": true,
                "include_raw_content": false,
            }))
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| format!("Read body: {e}"))?;
        Ok(json!({
            "source": "tavily",
            "place_name": args.place_name,
            "answer": body.get("answer").cloned().unwrap_or(Value::Null),
            "results": body.get("results").cloned().unwrap_or_else(|| json!([])),
            "summary": "Review data fetched successfully",
        }))
    }
}

#[async_trait]
impl Tool for ReviewSearchTool {
    fn name(&self) -> &str {
        SEARCH_REVIEWS_TOOL
    }

    fn description(&self) -> &str {
        "Search reviews and ratings for a place (Tavily). Args: {\"place_name\": \"...\", \"city\": \"...\"}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "place_name": {"type": "string"},
                "city": {"type": "string"}
            },
            "required": ["place_name", "city"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: SearchReviewsArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid args: {e}"))?;
        let Some(api_key) = configured(&self.cfg.api_key) else {
            return Ok(json!({
                "source": "fallback",
                "message": "Tavily API not configured, using basic analysis",
            }));
        };
        tracing::info!(place = %args.place_name, city = %args.city, "search_reviews");
        match self.search(api_key, &args).await {
            Ok(v) => Ok(v),
            Err(e) => Ok(json!({"source": "error", "error": e})),
        }
    }
}
