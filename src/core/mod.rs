//! 核心层：错误与恢复、共享状态记录

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use state::{
    AgentState, Critique, CritiqueOutcome, PlaceAnalysis, QueryRequest, QuestionType,
    Recommendation, Route, ShopResponse, WorkflowStep,
};
