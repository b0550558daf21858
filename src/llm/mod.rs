//! LLM 层：补全服务抽象与实现（OpenAI 兼容 / Groq / 主备切换 / Mock）

pub mod fallback;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use fallback::FallbackLlmClient;
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::LlmClient;

use crate::config::{configured, LlmSection};

/// 按配置创建补全客户端；未配置 Key 或 provider 为 mock 时使用 MockLlmClient
///
/// temperature 单独传入：商家模拟与评价抽取使用不同温度。
pub fn create_llm_from_config(cfg: &LlmSection, temperature: f32) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let primary_key = configured(&cfg.api_key);

    let Some(primary_key) = primary_key.filter(|_| provider != "mock") else {
        tracing::warn!(provider = %provider, "No API key set or provider is mock, using Mock LLM");
        return Arc::new(MockLlmClient);
    };

    let base_url = match provider.as_str() {
        "openai" => cfg.base_url.as_deref().filter(|u| *u != crate::config::GROQ_BASE_URL),
        _ => cfg.base_url.as_deref().or(Some(crate::config::GROQ_BASE_URL)),
    };
    let build = |key: &str| -> Arc<dyn LlmClient> {
        Arc::new(
            OpenAiClient::new(base_url, &cfg.model, key)
                .with_temperature(temperature)
                .with_max_tokens(cfg.max_tokens)
                .with_timeout(cfg.timeouts.request),
        )
    };

    tracing::info!(provider = %provider, model = %cfg.model, "Using OpenAI-compatible LLM");
    match configured(&cfg.api_key_secondary) {
        Some(secondary) => Arc::new(FallbackLlmClient::new(build(primary_key), build(secondary))),
        None => build(primary_key),
    }
}
