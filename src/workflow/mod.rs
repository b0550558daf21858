//! 工作流层：Router、Reflexion 控制器、人工审批关口与 Checkpoint 存储

pub mod approval;
pub mod checkpoint;
pub mod engine;
pub mod reflexion;
pub mod router;

pub use approval::ApprovalDecision;
pub use checkpoint::{
    create_checkpoint_store, CheckpointMeta, CheckpointStore, MemoryCheckpointStore,
    SqliteCheckpointStore,
};
pub use engine::{next_step, RunOutcome, WorkflowEngine};
pub use router::{route_state, select_route, DEFAULT_ROUTE};
