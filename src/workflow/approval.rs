//! 人工审批关口
//!
//! 挂起不是失败：FINALIZING 发现需要审批时持久化状态并结束本次调用；
//! 之后任意时间由外部提交 ApprovalDecision，WorkflowEngine 从 Checkpoint 重建上下文继续。

use serde::{Deserialize, Serialize};

use crate::core::{AgentError, AgentState, Route, WorkflowStep};
use crate::memory::Message;

/// 外部审批信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve { notes: Option<String> },
    /// 拒绝：记录备注，以空推荐结束会话
    Reject { notes: String },
}

/// 会话初始化时决定是否需要人工确认
pub fn requires_approval(route: Route, policy_enabled: bool) -> bool {
    policy_enabled && route == Route::Negotiation
}

/// 审批已给出且结论为拒绝
pub fn is_rejected(state: &AgentState) -> bool {
    state.approval_required && !state.human_approved && state.human_notes.is_some()
}

/// 把审批结论写入状态；只能作用于挂起中的会话
pub fn apply_decision(state: &mut AgentState, decision: ApprovalDecision) -> Result<(), AgentError> {
    if state.current_step != WorkflowStep::AwaitingApproval || !state.approval_pending() {
        return Err(AgentError::InvalidState(format!(
            "thread {} is not awaiting approval (step {})",
            state.thread_id, state.current_step
        )));
    }
    let message = match decision {
        ApprovalDecision::Approve { notes } => {
            state.human_approved = true;
            let text = match &notes {
                Some(n) => format!("Approved: {n}"),
                None => "Approved".to_string(),
            };
            state.human_notes = notes;
            text
        }
        ApprovalDecision::Reject { notes } => {
            let notes = if notes.trim().is_empty() {
                "Rejected".to_string()
            } else {
                notes
            };
            state.human_approved = false;
            state.human_notes = Some(notes.clone());
            format!("Rejected: {notes}")
        }
    };
    state.push_messages([Message::user(message)]);
    Ok(())
}

/// 挂起时写入对话的提示
pub fn suspension_message(state: &AgentState) -> Message {
    let candidates = state.latest_analysis().len();
    Message::assistant(format!(
        "Collected negotiation results for {candidates} place(s) after {} reflection round(s). Awaiting your approval before finalizing.",
        state.iteration
    ))
}
