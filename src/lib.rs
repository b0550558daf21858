//! Negotiator - 本地商家搜索与模拟议价智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 共享状态记录、错误与恢复
//! - **llm**: 补全服务抽象与实现（OpenAI 兼容 / Groq / 主备 / Mock）
//! - **memory**: 对话消息与只追加合并
//! - **observability**: 日志初始化
//! - **tools**: 协作方适配器（商家搜索、评价搜索、模拟商家、价格对比、评价抽取）与执行器
//! - **workflow**: Router、Reflexion 状态机、人工审批、Checkpoint

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use crate::core::{AgentError, AgentState, QueryRequest, Recommendation, Route, WorkflowStep};
pub use workflow::{ApprovalDecision, RunOutcome, WorkflowEngine};
