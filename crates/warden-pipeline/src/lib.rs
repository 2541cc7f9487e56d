//! Pipeline graph engine, checkpoints, guard rails, lifecycle scheduler and
//! health monitor.
//!
//! A pipeline is a DOT graph file plus a state directory. The scheduler moves
//! nodes through their lifecycle under a single-writer lock, snapshots every
//! change as an append-only checkpoint and records it in the audit log. The
//! watcher drives the scheduler from file signals.

pub mod checkpoint;
pub mod config;
pub mod edit;
pub mod events;
pub mod graph;
pub mod guard;
pub mod health;
pub mod scheduler;
pub mod store;
pub mod validation;
pub mod watcher;

pub use checkpoint::{CheckpointInfo, CheckpointStore};
pub use config::{load_config, GuardConfig, LockConfig, WardenConfig, DEFAULT_CONFIG_FILE};
pub use edit::{gate_id_for, EdgeFilter, EditSummary, NodePatch, NodeSpec};
pub use events::{EventEmitter, PipelineEvent};
pub use graph::{GraphMeta, NodeMetadata, PipelineEdge, PipelineGraph, PipelineNode};
pub use guard::{GuardContext, GuardDecision, GuardRails};
pub use health::{assess, HealthLabel, HealthPolicy, HealthReport};
pub use scheduler::{
    dispatch_target, FailureOutcome, PauseOutcome, Scheduler, TransitionReceipt,
    TransitionRequest, SCHEDULER_INBOX,
};
pub use store::PipelineStore;
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use watcher::{PollReport, Watcher};
