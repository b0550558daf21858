//! 主备 Key 切换：主客户端失败时改用备用客户端重试一次

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;

pub struct FallbackLlmClient {
    primary: Arc<dyn LlmClient>,
    secondary: Arc<dyn LlmClient>,
}

impl FallbackLlmClient {
    pub fn new(primary: Arc<dyn LlmClient>, secondary: Arc<dyn LlmClient>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl LlmClient for FallbackLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        match self.primary.complete(messages).await {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::warn!(error = %e, "primary completion failed, trying secondary key");
                self.secondary
                    .complete(messages)
                    .await
                    .map_err(|e2| format!("primary: {e}; secondary: {e2}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl LlmClient for Failing {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            Err("rate limited".to_string())
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl LlmClient for Fixed {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_secondary_used_when_primary_fails() {
        let client = FallbackLlmClient::new(Arc::new(Failing), Arc::new(Fixed("ok")));
        assert_eq!(client.complete_prompt("hi").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_both_errors_reported() {
        let client = FallbackLlmClient::new(Arc::new(Failing), Arc::new(Failing));
        let err = client.complete_prompt("hi").await.unwrap_err();
        assert!(err.contains("primary") && err.contains("secondary"));
    }
}
