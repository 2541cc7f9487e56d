//! Scheduler event stream.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! supervisors can follow transitions, refusals and dispatches without
//! reading the audit log.

use serde::{Deserialize, Serialize};

use warden_types::{NodeStatus, RejectReason};

/// Events emitted by the scheduler and watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    NodeTransitioned {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
        actor: String,
        revision: u64,
    },
    TransitionRejected {
        node_id: String,
        to: NodeStatus,
        error: String,
    },
    GuardEvaluated {
        node_id: String,
        to: NodeStatus,
        allowed: bool,
        reason: Option<RejectReason>,
        spot_check_selected: bool,
    },
    CheckpointSaved {
        seq: u64,
        revision: u64,
    },
    NodeDispatched {
        node_id: String,
        target: String,
    },
    SignalConsumed {
        signal_id: String,
        signal_type: String,
        source: String,
    },
    RetriesExhausted {
        node_id: String,
        attempts: u32,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
