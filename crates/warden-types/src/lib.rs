//! Shared types, errors, and file primitives for the warden pipeline scheduler.
//!
//! This crate provides the foundational types used across all other warden crates:
//! - `WardenError`: unified error taxonomy (structural, lifecycle, integrity, policy)
//! - `NodeKind` / `NodeStatus`: the typed core schema of a pipeline node
//! - `Actor` / `Role`: who is asking for a state change
//! - `Evidence`: a worker's claim of progress, evaluated before it is trusted
//! - [`fs`], [`lock`], [`retry`]: atomic writes, cross-process locks, bounded retry

pub mod fs;
pub mod lock;
pub mod retry;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Unified error type for all warden subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    // === Structural Errors ===
    #[error("Graph parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Node '{0}' already exists")]
    DuplicateNode(String),

    #[error("Node '{0}' does not exist")]
    UnknownNode(String),

    #[error("Edge {from} -> {to} already exists")]
    DuplicateEdge { from: String, to: String },

    #[error("Edge {from} -> {to} does not exist")]
    UnknownEdge { from: String, to: String },

    #[error("Edge {from} -> {to} would create a cycle ({})", path.join(" -> "))]
    CycleDetected {
        from: String,
        to: String,
        path: Vec<String>,
    },

    #[error("Node '{node}' still has {count} edge(s); remove them first or cascade")]
    NodeHasEdges { node: String, count: usize },

    #[error("Field '{field}' of node '{node}' cannot be changed")]
    ImmutableField { node: String, field: String },

    #[error("Invalid attribute '{key}' on '{owner}': {message}")]
    InvalidAttribute {
        owner: String,
        key: String,
        message: String,
    },

    // === Lifecycle Errors ===
    #[error("Illegal transition for node '{node}': {from} -> {to}")]
    IllegalTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Node '{node}' is {actual}, expected {expected}")]
    StatusConflict {
        node: String,
        expected: NodeStatus,
        actual: NodeStatus,
    },

    #[error("Node '{node}' is not dispatchable: {reason}")]
    NotDispatchable { node: String, reason: String },

    #[error("Max retries exhausted for node '{node}' after {attempts} retries")]
    RetriesExhausted { node: String, attempts: u32 },

    #[error("Pipeline '{pipeline}' is paused")]
    Paused { pipeline: String },

    // === Integrity Errors ===
    #[error("Audit chain broken at entry {index}: {reason}")]
    ChainBroken { index: u64, reason: String },

    #[error("Corrupt signal file {}: {reason}", path.display())]
    CorruptSignal { path: PathBuf, reason: String },

    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    // === Policy Errors ===
    #[error("Guard rejected {action} on node '{node}': {reason} ({detail})")]
    GuardRejected {
        node: String,
        action: String,
        reason: RejectReason,
        detail: String,
    },

    // === Transient Errors ===
    #[error("Lock {} still held after {attempts} attempts", path.display())]
    LockContended { path: PathBuf, attempts: usize },

    // === Generic ===
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse failure category, used for exit codes and for telling callers
/// whether a refusal was about shape, lifecycle, tampering or policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Structural,
    Lifecycle,
    Integrity,
    Policy,
    Transient,
    Io,
    Config,
}

impl WardenError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WardenError::ParseError { .. }
            | WardenError::ValidationError(_)
            | WardenError::DuplicateNode(_)
            | WardenError::UnknownNode(_)
            | WardenError::DuplicateEdge { .. }
            | WardenError::UnknownEdge { .. }
            | WardenError::CycleDetected { .. }
            | WardenError::NodeHasEdges { .. }
            | WardenError::ImmutableField { .. }
            | WardenError::InvalidAttribute { .. } => ErrorCategory::Structural,
            WardenError::IllegalTransition { .. }
            | WardenError::StatusConflict { .. }
            | WardenError::NotDispatchable { .. }
            | WardenError::RetriesExhausted { .. }
            | WardenError::Paused { .. } => ErrorCategory::Lifecycle,
            WardenError::ChainBroken { .. }
            | WardenError::CorruptSignal { .. }
            | WardenError::CorruptCheckpoint { .. } => ErrorCategory::Integrity,
            WardenError::GuardRejected { .. } => ErrorCategory::Policy,
            WardenError::LockContended { .. } => ErrorCategory::Transient,
            WardenError::Io(e) if is_transient_io(e) => ErrorCategory::Transient,
            WardenError::Io(_) | WardenError::Json(_) | WardenError::Other(_) => {
                ErrorCategory::Io
            }
            WardenError::Config(_) => ErrorCategory::Config,
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Returns `true` if the error signals corruption or tampering and needs an operator.
    pub fn is_integrity(&self) -> bool {
        self.category() == ErrorCategory::Integrity
    }

    /// Maps the error to the CLI exit code for its category.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Structural => 2,
            ErrorCategory::Lifecycle => 3,
            ErrorCategory::Integrity => 4,
            ErrorCategory::Policy => 5,
            ErrorCategory::Transient => 6,
            ErrorCategory::Io | ErrorCategory::Config => 1,
        }
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

/// A convenience alias for `Result<T, WardenError>`.
pub type Result<T> = std::result::Result<T, WardenError>;

// ---------------------------------------------------------------------------
// NodeKind: what sort of work a node represents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Exit,
    Task,
    Gate,
    Decision,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Start,
        NodeKind::Exit,
        NodeKind::Task,
        NodeKind::Gate,
        NodeKind::Decision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Exit => "exit",
            NodeKind::Task => "task",
            NodeKind::Gate => "gate",
            NodeKind::Decision => "decision",
        }
    }

    /// Graph-file shape used to render this kind.
    pub fn shape(self) -> &'static str {
        match self {
            NodeKind::Start => "Mdiamond",
            NodeKind::Exit => "Msquare",
            NodeKind::Task => "box",
            NodeKind::Gate => "hexagon",
            NodeKind::Decision => "diamond",
        }
    }

    pub fn from_shape(shape: &str) -> Option<Self> {
        NodeKind::ALL.into_iter().find(|k| k.shape() == shape)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        NodeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| WardenError::Other(format!("unknown node kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// NodeStatus: lifecycle position of a node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Active,
    ImplComplete,
    Validated,
    Failed,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 5] = [
        NodeStatus::Pending,
        NodeStatus::Active,
        NodeStatus::ImplComplete,
        NodeStatus::Validated,
        NodeStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Active => "active",
            NodeStatus::ImplComplete => "impl_complete",
            NodeStatus::Validated => "validated",
            NodeStatus::Failed => "failed",
        }
    }

    /// The transition table. Anything not listed here is illegal.
    pub fn successors(self) -> &'static [NodeStatus] {
        match self {
            NodeStatus::Pending => &[NodeStatus::Active],
            NodeStatus::Active => &[NodeStatus::ImplComplete, NodeStatus::Failed],
            NodeStatus::ImplComplete => &[NodeStatus::Validated, NodeStatus::Failed],
            NodeStatus::Failed => &[NodeStatus::Active],
            NodeStatus::Validated => &[],
        }
    }

    pub fn can_transition_to(self, to: NodeStatus) -> bool {
        self.successors().contains(&to)
    }

    /// Work has been handed to a worker and not yet settled.
    pub fn is_in_flight(self) -> bool {
        matches!(self, NodeStatus::Active | NodeStatus::ImplComplete)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        NodeStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| WardenError::Other(format!("unknown node status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Actor / Role: who is asking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Implementer,
    Validator,
    Scheduler,
    Operator,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Implementer,
        Role::Validator,
        Role::Scheduler,
        Role::Operator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Implementer => "implementer",
            Role::Validator => "validator",
            Role::Scheduler => "scheduler",
            Role::Operator => "operator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| WardenError::Other(format!("unknown role '{s}'")))
    }
}

/// Identity plus role of the process requesting a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// The built-in identity the scheduler uses for dispatch and retries.
    pub fn scheduler() -> Self {
        Self::new("scheduler", Role::Scheduler)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.role)
    }
}

// ---------------------------------------------------------------------------
// Policy rejection reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ForbiddenActor,
    SelfCertification,
    RetryLimitExceeded,
    MissingEvidence,
    StaleEvidence,
    FutureEvidence,
    LowConfidence,
    SpotCheckRequired,
    SpotCheckFailed,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::ForbiddenActor => "forbidden_actor",
            RejectReason::SelfCertification => "self_certification",
            RejectReason::RetryLimitExceeded => "retry_limit_exceeded",
            RejectReason::MissingEvidence => "missing_evidence",
            RejectReason::StaleEvidence => "stale_evidence",
            RejectReason::FutureEvidence => "future_evidence",
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::SpotCheckRequired => "spot_check_required",
            RejectReason::SpotCheckFailed => "spot_check_failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Evidence: a worker's claim of progress
// ---------------------------------------------------------------------------

/// A claim of work completion. Nothing in it is trusted until the guard rails
/// have checked its age, its author and, when sampled, its deep verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Identity of the process that produced the claim.
    pub actor: String,
    pub produced_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<serde_json::Value>,
    /// Result of an independent deep re-verification, if one was performed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_verification: Option<bool>,
}

impl Evidence {
    pub fn new(actor: impl Into<String>, produced_at: DateTime<Utc>) -> Self {
        Self {
            actor: actor.into(),
            produced_at,
            confidence: None,
            proof: None,
            deep_verification: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_proof(mut self, proof: serde_json::Value) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn with_deep_verification(mut self, passed: bool) -> Self {
        self.deep_verification = Some(passed);
        self
    }
}
