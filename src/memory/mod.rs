//! 会话记忆：对话消息与追加式合并

pub mod conversation;

pub use conversation::{merge_messages, Message, Role};
