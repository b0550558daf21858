//! 补全服务抽象
//!
//! 所有后端（OpenAI 兼容 / Groq / Mock）实现 LlmClient：输入消息，返回文本。具体选哪个后端是配置问题，核心只依赖此 trait。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 单条 prompt 的便捷调用
    async fn complete_prompt(&self, prompt: &str) -> Result<String, String> {
        self.complete(&[Message::user(prompt)]).await
    }
}
