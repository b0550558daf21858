//! 错误恢复引擎
//!
//! 根据 AgentError 类型与出错的工具返回 RecoveryAction，供工作流决定是降级继续、使用预设回复还是进入 FAILED。

use crate::core::{AgentError, RecoveryAction};
use crate::tools::CONTACT_SHOP_TOOL;

/// 语义化错误恢复：协作方错误只降级，Checkpoint 与状态错误终止
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// tool 为出错时正在调用的工具名（非工具错误时为 None）
    pub fn handle(&self, err: &AgentError, tool: Option<&str>) -> RecoveryAction {
        match err {
            AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::UnknownTool(_)
            | AgentError::LlmError(_)
            | AgentError::JsonParseError(_) => {
                if tool == Some(CONTACT_SHOP_TOOL) {
                    RecoveryAction::UseFallback
                } else {
                    RecoveryAction::ContinueDegraded
                }
            }
            AgentError::Checkpoint(_)
            | AgentError::ThreadNotFound(_)
            | AgentError::ConfigError(_)
            | AgentError::InvalidState(_) => RecoveryAction::Abort,
        }
    }
}
