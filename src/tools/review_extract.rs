//! fetch_reviews：WebScraping.AI 抓取 Google 结果页 + LLM 抽取用户评价
//!
//! HTML 经 html2text 转为纯文本并截断到 max_page_chars，再让模型只输出 JSON 字符串数组；
//! 返回的评价条数不超过 limit。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{configured, WebScrapingSection};
use crate::llm::LlmClient;
use crate::tools::{Tool, FETCH_REVIEWS_TOOL};

fn default_limit() -> usize {
    3
}

#[derive(Debug, Deserialize)]
struct FetchReviewsArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub struct ReviewExtractTool {
    client: Client,
    llm: Arc<dyn LlmClient>,
    cfg: WebScrapingSection,
}

impl ReviewExtractTool {
    pub fn new(cfg: WebScrapingSection, llm: Arc<dyn LlmClient>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, llm, cfg }
    }

    async fn fetch_page_text(&self, api_key: &str, query: &str) -> Result<String, String> {
        let target = Url::parse_with_params(
            "https://www.google.com/search",
            &[("q", format!("reviews for {query}"))],
        )
        .map_err(|e| e.to_string())?;

        tracing::info!(query = %query, "fetching review page via WebScraping.AI");
        let resp = self
            .client
            .get(&self.cfg.api_url)
            .query(&[
                ("api_key", api_key),
                ("url", target.as_str()),
                ("device", "desktop"),
                ("proxy", "residential"),
                ("js", "true"),
            ])
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("Error fetching page: {}", resp.status()));
        }
        let html = resp.text().await.map_err(|e| format!("Read body: {e}"))?;
        Ok(page_text(&html, self.cfg.max_page_chars))
    }
}

/// HTML 转可读文本并截断
fn page_text(html: &str, max_chars: usize) -> String {
    let text = match from_read(html.as_bytes(), 200) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => html.to_string(),
    };
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    text.chars().take(max_chars).collect()
}

/// 解析模型输出：JSON 数组取字符串项，其他 JSON 转为单条，无法解析时原文作为单条
pub fn parse_review_list(content: &str, limit: usize) -> Vec<String> {
    let content = content.trim();
    let content = content
        .strip_prefix("```json")
        .or_else(|| content.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(content);

    let reviews = match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Ok(other) => vec![other.to_string()],
        Err(_) if content.is_empty() => Vec::new(),
        Err(_) => vec![content.to_string()],
    };
    reviews.into_iter().take(limit).collect()
}

#[async_trait]
impl Tool for ReviewExtractTool {
    fn name(&self) -> &str {
        FETCH_REVIEWS_TOOL
    }

    fn description(&self) -> &str {
        "Fetch user reviews for a place (WebScraping.AI + LLM extraction). Args: {\"query\": \"name and address\", \"limit\": 3}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "minimum": 0}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: FetchReviewsArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid args: {e}"))?;
        let api_key = configured(&self.cfg.api_key)
            .ok_or_else(|| "WebScraping.AI API key not configured".to_string())?;
        if args.limit == 0 {
            return Ok(json!([]));
        }

        let text = self.fetch_page_text(api_key, &args.query).await?;
        let prompt = format!(
            "Here is the text content of a Google Search page for '{q}'. \
             Extract the top {limit} most relevant and detailed user reviews for this place. \
             Look for text that looks like user feedback, ratings, or comments. \
             Return ONLY a raw JSON list of strings. Example: [\"Great coffee!\", \"Service was slow.\"]. \
             If no reviews are found, return [].\n\nPAGE TEXT:\n{text}",
            q = args.query,
            limit = args.limit,
        );
        let content = self.llm.complete_prompt(&prompt).await?;
        Ok(json!(parse_review_list(&content, args.limit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_parse_fenced_list_respects_limit() {
        let out = parse_review_list("```json\n[\"Great\", \"Clean\", \"Crowded\"]\n```", 2);
        assert_eq!(out, vec!["Great", "Clean"]);
    }

    #[test]
    fn test_parse_non_json_kept_as_single_review() {
        assert_eq!(parse_review_list("Nice staff", 3), vec!["Nice staff"]);
        assert!(parse_review_list("[]", 3).is_empty());
    }

    #[test]
    fn test_page_text_strips_markup_and_truncates() {
        let text = page_text("<html><body><p>Great   place</p></body></html>", 5);
        assert_eq!(text.chars().count(), 5);
        assert!(!text.contains('<'));
    }

    #[tokio::test]
    async fn test_missing_key_is_error() {
        let tool = ReviewExtractTool::new(WebScrapingSection::default(), Arc::new(MockLlmClient));
        let err = tool.execute(json!({"query": "Iron Temple Pune"})).await.unwrap_err();
        assert!(err.contains("not configured"));
    }
}
