//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 ContinueDegraded / UseFallback / Abort。

use thiserror::Error;

/// 工作流运行过程中可能出现的错误（工具、LLM、解析、Checkpoint 等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    /// Checkpoint 读写失败，属于不可恢复错误
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 状态记录不满足当前操作的前提（如对未挂起的会话提交审批）
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Checkpoint(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::JsonParseError(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 协作方失败：把该字段/商家视为缺失，继续流程
    ContinueDegraded,
    /// 模拟器不可用：使用预设回复
    UseFallback,
    /// 不可恢复：进入 FAILED 并持久化诊断信息
    Abort,
}
