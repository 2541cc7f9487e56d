//! Lifecycle scheduler.
//!
//! Every state change follows the same protocol under the pipeline lock:
//! load the latest checkpoint, check the request against the lifecycle,
//! run the guard rails (which audit their decision), apply, commit a new
//! checkpoint, then audit the transition. Nothing is cached between calls,
//! so a restarted process resumes exactly from the last checkpoint.

use std::path::PathBuf;

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use warden_audit::AuditLog;
use warden_signal::SignalChannel;
use warden_types::lock::FileLock;
use warden_types::{
    Actor, Evidence, NodeKind, NodeStatus, RejectReason, Result, Role, WardenError,
};

use crate::checkpoint::CheckpointInfo;
use crate::config::WardenConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::guard::{GuardContext, GuardRails, GUARD_ACTION};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::health::{assess, HealthPolicy, HealthReport};
use crate::store::PipelineStore;

/// Inbox the watcher drains on behalf of the scheduler.
pub const SCHEDULER_INBOX: &str = "scheduler";

/// Who receives work for `node`: its `role` metadata, else its handler, else a
/// default for its kind.
pub fn dispatch_target(node: &PipelineNode) -> String {
    if let Some(role) = node.meta.role.as_deref() {
        return role.to_string();
    }
    if let Some(handler) = node.handler.as_deref() {
        return handler.to_string();
    }
    match node.kind {
        NodeKind::Task => Role::Implementer.as_str().to_string(),
        NodeKind::Gate => Role::Validator.as_str().to_string(),
        NodeKind::Start | NodeKind::Exit | NodeKind::Decision => {
            Role::Operator.as_str().to_string()
        }
    }
}

/// A requested status change.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub node: String,
    pub to: NodeStatus,
    pub actor: Actor,
    /// Optimistic-concurrency check: refuse unless the node is currently in this status.
    pub expected: Option<NodeStatus>,
    pub evidence: Option<Evidence>,
    pub reason: Option<String>,
}

impl TransitionRequest {
    pub fn new(node: impl Into<String>, to: NodeStatus, actor: Actor) -> Self {
        Self {
            node: node.into(),
            to,
            actor,
            expected: None,
            evidence: None,
            reason: None,
        }
    }

    pub fn expect_status(mut self, status: NodeStatus) -> Self {
        self.expected = Some(status);
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReceipt {
    pub node: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub revision: u64,
    pub checkpoint_seq: u64,
    pub audit_hash: String,
    pub spot_check_selected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back in `active` for another attempt.
    Retrying { attempt: u32 },
    /// Left in `failed`; a retry may still be requested.
    Failed,
    /// Limit reached; permanently failed.
    Terminal { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PauseOutcome {
    pub paused: bool,
    /// False when the pipeline was already in the requested state.
    pub changed: bool,
    pub revision: u64,
    /// Active nodes whose workers were sent a `cancel` signal.
    pub cancelled: Vec<String>,
}

#[derive(Clone)]
pub struct Scheduler {
    store: PipelineStore,
    config: WardenConfig,
    guard: GuardRails,
    audit: AuditLog,
    signals: SignalChannel,
    events: EventEmitter,
}

impl Scheduler {
    pub fn open(graph_path: impl Into<PathBuf>, config: WardenConfig) -> Result<Self> {
        config.validate()?;
        let store = PipelineStore::open(graph_path, &config)?;
        let audit = store.audit_log()?;
        let signals = store.signals();
        Ok(Self {
            guard: GuardRails::new(config.guard.clone()),
            store,
            config,
            audit,
            signals,
            events: EventEmitter::default(),
        })
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Import the graph file as the first checkpoint.
    pub fn init(&self) -> Result<(PipelineGraph, CheckpointInfo)> {
        let (graph, info) = self.store.init()?;
        self.audit.append(
            "operator",
            "pipeline.init",
            json!({
                "pipeline": self.store.pipeline_id(),
                "session": graph.session(),
                "revision": info.revision,
                "checkpoint_seq": info.seq,
                "nodes": graph.node_count(),
            }),
        )?;
        self.events.emit(PipelineEvent::CheckpointSaved {
            seq: info.seq,
            revision: info.revision,
        });
        Ok((graph, info))
    }

    /// Re-import the hand-edited graph file as a new checkpoint.
    pub fn import(&self, actor: &Actor) -> Result<(PipelineGraph, CheckpointInfo)> {
        let (graph, info) = self.store.import()?;
        self.audit.append(
            &actor.id,
            "checkpoint.import",
            json!({
                "revision": info.revision,
                "checkpoint_seq": info.seq,
                "nodes": graph.node_count(),
                "edges": graph.edges().len(),
            }),
        )?;
        self.events.emit(PipelineEvent::CheckpointSaved {
            seq: info.seq,
            revision: info.revision,
        });
        Ok((graph, info))
    }

    /// Current graph, from the latest checkpoint.
    pub fn graph(&self) -> Result<PipelineGraph> {
        self.store.load()
    }

    /// Ids of pending nodes whose dependencies are all validated, in insertion order.
    pub fn find_dispatchable(&self) -> Result<Vec<String>> {
        Ok(self
            .graph()?
            .dispatchable()
            .into_iter()
            .map(|n| n.id.clone())
            .collect())
    }

    pub fn health(&self) -> Result<HealthReport> {
        let graph = self.graph()?;
        let summary = self.audit.summarize()?;
        Ok(assess(
            &graph,
            Some(&summary),
            &HealthPolicy::from_config(&self.config),
            Utc::now(),
        ))
    }

    /// Apply a structural edit: validated, committed as a new checkpoint, audited.
    pub fn edit<T>(
        &self,
        actor: &Actor,
        description: &str,
        op: impl FnOnce(&mut PipelineGraph) -> Result<T>,
    ) -> Result<(T, CheckpointInfo)> {
        let lock = self.store.lock()?;
        let mut graph = self.store.load_for_update(&lock)?;
        let out = op(&mut graph)?;
        let info = self.store.commit(&lock, &mut graph)?;
        self.audit.append(
            &actor.id,
            "graph.edit",
            json!({
                "edit": description,
                "role": actor.role,
                "revision": info.revision,
                "checkpoint_seq": info.seq,
            }),
        )?;
        self.events.emit(PipelineEvent::CheckpointSaved {
            seq: info.seq,
            revision: info.revision,
        });
        Ok((out, info))
    }

    /// Move a node to a new status.
    ///
    /// Lifecycle refusals (status conflict, illegal transition, not dispatchable,
    /// paused, exhausted) and guard refusals leave the status unchanged but are
    /// counted in the node's `rejected_attempts` and recorded.
    pub fn transition(&self, req: TransitionRequest) -> Result<TransitionReceipt> {
        let lock = self.store.lock()?;
        let mut graph = self.store.load_for_update(&lock)?;
        let node = graph
            .node(&req.node)
            .cloned()
            .ok_or_else(|| WardenError::UnknownNode(req.node.clone()))?;
        let from = node.status;

        if let Some(expected) = req.expected {
            if expected != from {
                let err = WardenError::StatusConflict {
                    node: node.id.clone(),
                    expected,
                    actual: from,
                };
                return self.refuse(&lock, graph, &req, from, err, true);
            }
        }

        if !from.can_transition_to(req.to) {
            let err = WardenError::IllegalTransition {
                node: node.id.clone(),
                from,
                to: req.to,
            };
            return self.refuse(&lock, graph, &req, from, err, true);
        }

        if req.to == NodeStatus::Active {
            if graph.is_paused() {
                let err = WardenError::Paused {
                    pipeline: self.store.pipeline_id().to_string(),
                };
                return self.refuse(&lock, graph, &req, from, err, true);
            }
            if from == NodeStatus::Pending && !graph.deps_met(&node.id) {
                let waiting = graph
                    .upstream(&node.id)
                    .into_iter()
                    .filter(|up| graph.node(up).map(|n| n.status) != Some(NodeStatus::Validated))
                    .collect::<Vec<_>>()
                    .join(", ");
                let err = WardenError::NotDispatchable {
                    node: node.id.clone(),
                    reason: format!("waiting on {waiting}"),
                };
                return self.refuse(&lock, graph, &req, from, err, true);
            }
            if from == NodeStatus::Failed && node.terminal {
                let err = WardenError::RetriesExhausted {
                    node: node.id.clone(),
                    attempts: node.retries,
                };
                return self.refuse(&lock, graph, &req, from, err, true);
            }
        }

        let now = Utc::now();
        let session = graph.session().unwrap_or_default().to_string();
        let max_retries = node.retry_limit(self.config.max_retries);
        let ctx = GuardContext {
            node: &node,
            to: req.to,
            actor: &req.actor,
            evidence: req.evidence.as_ref(),
            session: &session,
            max_retries,
        };
        let decision = self.guard.evaluate(&ctx, now, &self.audit)?;
        self.events.emit(PipelineEvent::GuardEvaluated {
            node_id: node.id.clone(),
            to: req.to,
            allowed: decision.allowed,
            reason: decision.reason,
            spot_check_selected: decision.spot_check_selected,
        });

        if decision.reason == Some(RejectReason::RetryLimitExceeded) {
            return self.exhaust(&lock, graph, &req, node.retries);
        }
        if let Err(err) = decision.clone().into_result(&node.id, req.to) {
            // The guard has already audited its own decision.
            return self.refuse(&lock, graph, &req, from, err, false);
        }

        let stamped = now.trunc_subsecs(6);
        let n = graph
            .node_mut(&node.id)
            .ok_or_else(|| WardenError::UnknownNode(node.id.clone()))?;
        if from == NodeStatus::Failed && req.to == NodeStatus::Active {
            n.retries += 1;
            n.claimed_by = None;
        }
        if req.to == NodeStatus::ImplComplete {
            n.claimed_by = Some(req.actor.id.clone());
        }
        n.status = req.to;
        n.updated_at = Some(stamped);

        let info = self.store.commit(&lock, &mut graph)?;
        let audit_hash = self.audit.append(
            &req.actor.id,
            "node.transition",
            json!({
                "node": node.id,
                "from": from,
                "to": req.to,
                "role": req.actor.role,
                "revision": info.revision,
                "checkpoint_seq": info.seq,
                "reason": req.reason,
                "evidence": req.evidence,
                "spot_check_selected": decision.spot_check_selected,
            }),
        )?;
        drop(lock);

        tracing::info!(
            node = %node.id,
            from = %from,
            to = %req.to,
            actor = %req.actor,
            revision = info.revision,
            "node transitioned"
        );
        self.events.emit(PipelineEvent::NodeTransitioned {
            node_id: node.id.clone(),
            from,
            to: req.to,
            actor: req.actor.id.clone(),
            revision: info.revision,
        });
        self.events.emit(PipelineEvent::CheckpointSaved {
            seq: info.seq,
            revision: info.revision,
        });

        Ok(TransitionReceipt {
            node: node.id,
            from,
            to: req.to,
            revision: info.revision,
            checkpoint_seq: info.seq,
            audit_hash,
            spot_check_selected: decision.spot_check_selected,
        })
    }

    /// Put a failed node back into `active`. Beyond its retry limit the node is
    /// marked terminal instead and `RetriesExhausted` is returned.
    pub fn retry(&self, node: &str, actor: Actor) -> Result<TransitionReceipt> {
        self.transition(
            TransitionRequest::new(node, NodeStatus::Active, actor).expect_status(NodeStatus::Failed),
        )
    }

    /// Move an in-flight node to `failed` and leave it there. The watcher
    /// retries it on its next dispatch pass, so the worker hears about it.
    pub fn fail(
        &self,
        node: &str,
        actor: Actor,
        reason: Option<String>,
        evidence: Option<Evidence>,
    ) -> Result<TransitionReceipt> {
        let mut req = TransitionRequest::new(node, NodeStatus::Failed, actor);
        req.reason = reason;
        req.evidence = evidence;
        self.transition(req)
    }

    /// Record a failure reported for an in-flight node. With `auto_retry` the
    /// node goes straight back to `active` while it is under its limit.
    pub fn record_failure(
        &self,
        node: &str,
        actor: Actor,
        reason: Option<String>,
        evidence: Option<Evidence>,
    ) -> Result<FailureOutcome> {
        self.fail(node, actor, reason, evidence)?;

        if !self.config.auto_retry || self.graph()?.is_paused() {
            return Ok(FailureOutcome::Failed);
        }
        match self.retry(node, Actor::scheduler()) {
            Ok(_) => {
                let attempt = self.graph()?.node(node).map_or(0, |n| n.retries);
                Ok(FailureOutcome::Retrying { attempt })
            }
            Err(WardenError::RetriesExhausted { attempts, .. }) => {
                Ok(FailureOutcome::Terminal { attempts })
            }
            Err(e) => Err(e),
        }
    }

    /// Administratively pause dispatch and ask active workers to stop.
    pub fn pause(&self, actor: &Actor, reason: Option<String>) -> Result<PauseOutcome> {
        self.set_paused(actor, true, reason)
    }

    pub fn resume(&self, actor: &Actor) -> Result<PauseOutcome> {
        self.set_paused(actor, false, None)
    }

    fn set_paused(&self, actor: &Actor, paused: bool, reason: Option<String>) -> Result<PauseOutcome> {
        let action = if paused { "pause" } else { "resume" };
        if !matches!(actor.role, Role::Operator | Role::Scheduler) {
            self.audit.append(
                &actor.id,
                GUARD_ACTION,
                json!({
                    "pipeline": self.store.pipeline_id(),
                    "action": action,
                    "role": actor.role,
                    "allowed": false,
                    "reason": RejectReason::ForbiddenActor,
                }),
            )?;
            return Err(WardenError::GuardRejected {
                node: self.store.pipeline_id().to_string(),
                action: action.to_string(),
                reason: RejectReason::ForbiddenActor,
                detail: format!("{actor} may not {action} the pipeline"),
            });
        }

        let lock = self.store.lock()?;
        let mut graph = self.store.load_for_update(&lock)?;
        if graph.is_paused() == paused {
            return Ok(PauseOutcome {
                paused,
                changed: false,
                revision: graph.revision(),
                cancelled: Vec::new(),
            });
        }

        graph.meta_mut().paused = paused;
        let info = self.store.commit(&lock, &mut graph)?;
        self.audit.append(
            &actor.id,
            if paused { "pipeline.paused" } else { "pipeline.resumed" },
            json!({
                "role": actor.role,
                "reason": reason,
                "revision": info.revision,
                "checkpoint_seq": info.seq,
            }),
        )?;
        drop(lock);
        self.events.emit(PipelineEvent::CheckpointSaved {
            seq: info.seq,
            revision: info.revision,
        });

        let mut cancelled = Vec::new();
        if paused {
            for node in graph.nodes().filter(|n| n.status == NodeStatus::Active) {
                let target = dispatch_target(node);
                let payload = json!({ "node": node.id, "reason": reason });
                match self.signals.send(SCHEDULER_INBOX, &target, "cancel", payload) {
                    Ok(_) => cancelled.push(node.id.clone()),
                    Err(e) => {
                        tracing::warn!(node = %node.id, target = %target, error = %e, "cancel signal not delivered")
                    }
                }
            }
        }
        tracing::info!(paused, actor = %actor, cancelled = cancelled.len(), "pipeline {action}d");

        Ok(PauseOutcome {
            paused,
            changed: true,
            revision: info.revision,
            cancelled,
        })
    }

    /// Record a refused request, then return `err`.
    fn refuse(
        &self,
        lock: &FileLock,
        mut graph: PipelineGraph,
        req: &TransitionRequest,
        from: NodeStatus,
        err: WardenError,
        audit: bool,
    ) -> Result<TransitionReceipt> {
        if let Some(n) = graph.node_mut(&req.node) {
            n.rejected_attempts += 1;
        }
        let info = self.store.commit(lock, &mut graph)?;
        if audit {
            self.audit.append(
                &req.actor.id,
                "node.transition_rejected",
                rejection_payload(req, from, &err, info.revision),
            )?;
        }
        tracing::warn!(node = %req.node, from = %from, to = %req.to, actor = %req.actor, error = %err, "transition refused");
        self.events.emit(PipelineEvent::TransitionRejected {
            node_id: req.node.clone(),
            to: req.to,
            error: err.to_string(),
        });
        Err(err)
    }

    /// Mark a node permanently failed after its retry budget is spent.
    fn exhaust(
        &self,
        lock: &FileLock,
        mut graph: PipelineGraph,
        req: &TransitionRequest,
        attempts: u32,
    ) -> Result<TransitionReceipt> {
        if let Some(n) = graph.node_mut(&req.node) {
            n.terminal = true;
            n.rejected_attempts += 1;
            n.updated_at = Some(Utc::now().trunc_subsecs(6));
        }
        let info = self.store.commit(lock, &mut graph)?;
        self.audit.append(
            &req.actor.id,
            "node.retries_exhausted",
            json!({
                "node": req.node,
                "attempts": attempts,
                "revision": info.revision,
                "checkpoint_seq": info.seq,
            }),
        )?;
        tracing::warn!(node = %req.node, attempts, "retries exhausted; node is permanently failed");
        self.events.emit(PipelineEvent::RetriesExhausted {
            node_id: req.node.clone(),
            attempts,
        });
        Err(WardenError::RetriesExhausted {
            node: req.node.clone(),
            attempts,
        })
    }
}

fn rejection_payload(req: &TransitionRequest, from: NodeStatus, err: &WardenError, revision: u64) -> Value {
    json!({
        "node": req.node,
        "from": from,
        "to": req.to,
        "role": req.actor.role,
        "expected": req.expected,
        "error": err.to_string(),
        "exit_code": err.exit_code(),
        "revision": revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const PIPELINE: &str = r#"digraph demo {
        a [handler="codegen"]
        b
        a -> b
    }"#;

    fn setup(src: &str) -> (tempfile::TempDir, Scheduler) {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("demo.dot");
        fs::write(&path, src).unwrap();
        let mut config = WardenConfig::default();
        config.guard.spot_check_rate = 0.0;
        let scheduler = Scheduler::open(&path, config).unwrap();
        scheduler.init().unwrap();
        (temp, scheduler)
    }

    fn operator() -> Actor {
        Actor::new("ops", Role::Operator)
    }

    fn implementer() -> Actor {
        Actor::new("worker-1", Role::Implementer)
    }

    fn fresh(actor: &str) -> Evidence {
        Evidence::new(actor, Utc::now()).with_confidence(0.9)
    }

    fn status(s: &Scheduler, id: &str) -> NodeStatus {
        s.graph().unwrap().node(id).unwrap().status
    }

    #[test]
    fn dispatch_target_defaults() {
        let mut task = PipelineNode::new("t", NodeKind::Task);
        assert_eq!(dispatch_target(&task), "implementer");
        task.handler = Some("codegen".into());
        assert_eq!(dispatch_target(&task), "codegen");
        task.meta.role = Some("reviewer".into());
        assert_eq!(dispatch_target(&task), "reviewer");
        assert_eq!(dispatch_target(&PipelineNode::new("g", NodeKind::Gate)), "validator");
        assert_eq!(dispatch_target(&PipelineNode::new("s", NodeKind::Start)), "operator");
    }

    #[test]
    fn transition_commits_checkpoint_and_audits() {
        let (_temp, s) = setup(PIPELINE);
        let receipt = s
            .transition(TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler()))
            .unwrap();

        assert_eq!(receipt.from, NodeStatus::Pending);
        assert_eq!(receipt.to, NodeStatus::Active);
        assert_eq!(receipt.checkpoint_seq, 1);
        assert_eq!(status(&s, "a"), NodeStatus::Active);
        assert_eq!(s.store().read_graph_file().unwrap().node("a").unwrap().status, NodeStatus::Active);

        let actions: Vec<String> = s.audit().entries().unwrap().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["pipeline.init", GUARD_ACTION, "node.transition"]);
        assert_eq!(s.audit().verify_chain().unwrap().head_hash, receipt.audit_hash);
    }

    #[test]
    fn status_skip_is_illegal_and_counted() {
        let (_temp, s) = setup(PIPELINE);
        let err = s
            .transition(TransitionRequest::new("a", NodeStatus::Validated, operator()))
            .unwrap_err();
        assert!(matches!(err, WardenError::IllegalTransition { .. }));
        assert_eq!(err.exit_code(), 3);

        let g = s.graph().unwrap();
        let a = g.node("a").unwrap();
        assert_eq!(a.status, NodeStatus::Pending);
        assert_eq!(a.rejected_attempts, 1);
        let last = s.audit().tail(1).unwrap().remove(0);
        assert_eq!(last.action, "node.transition_rejected");
    }

    #[test]
    fn upstream_must_be_validated() {
        let (_temp, s) = setup(PIPELINE);
        let err = s
            .transition(TransitionRequest::new("b", NodeStatus::Active, Actor::scheduler()))
            .unwrap_err();
        assert!(matches!(err, WardenError::NotDispatchable { ref reason, .. } if reason.contains('a')));
    }

    #[test]
    fn stale_expectation_is_a_conflict() {
        let (_temp, s) = setup(PIPELINE);
        s.transition(TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler()))
            .unwrap();
        let err = s
            .transition(
                TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler())
                    .expect_status(NodeStatus::Pending),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::StatusConflict { expected: NodeStatus::Pending, actual: NodeStatus::Active, .. }
        ));
    }

    #[test]
    fn guard_rejection_leaves_status() {
        let (_temp, s) = setup(PIPELINE);
        s.transition(TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler()))
            .unwrap();
        let err = s
            .transition(TransitionRequest::new("a", NodeStatus::ImplComplete, implementer()))
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::GuardRejected { reason: RejectReason::MissingEvidence, .. }
        ));
        assert_eq!(status(&s, "a"), NodeStatus::Active);
        assert_eq!(s.graph().unwrap().node("a").unwrap().rejected_attempts, 1);
    }

    #[test]
    fn claim_is_recorded_and_blocks_self_certification() {
        let (_temp, s) = setup(PIPELINE);
        s.transition(TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler()))
            .unwrap();
        s.transition(
            TransitionRequest::new("a", NodeStatus::ImplComplete, implementer())
                .with_evidence(fresh("worker-1")),
        )
        .unwrap();
        assert_eq!(
            s.graph().unwrap().node("a").unwrap().claimed_by.as_deref(),
            Some("worker-1")
        );

        let sneaky = Actor::new("worker-1", Role::Validator);
        let err = s
            .transition(
                TransitionRequest::new("a", NodeStatus::Validated, sneaky)
                    .with_evidence(fresh("worker-1")),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::GuardRejected { reason: RejectReason::SelfCertification, .. }
        ));
    }

    #[test]
    fn failure_auto_retries_until_terminal() {
        let (_temp, s) = setup(PIPELINE);
        s.transition(TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler()))
            .unwrap();

        for attempt in 1..=3 {
            let outcome = s.record_failure("a", implementer(), None, None).unwrap();
            assert_eq!(outcome, FailureOutcome::Retrying { attempt });
        }
        let outcome = s.record_failure("a", implementer(), Some("again".into()), None).unwrap();
        assert_eq!(outcome, FailureOutcome::Terminal { attempts: 3 });

        let g = s.graph().unwrap();
        let a = g.node("a").unwrap();
        assert_eq!(a.status, NodeStatus::Failed);
        assert!(a.terminal);

        let err = s.retry("a", operator()).unwrap_err();
        assert!(matches!(err, WardenError::RetriesExhausted { .. }));
        assert_eq!(status(&s, "a"), NodeStatus::Failed);
    }

    #[test]
    fn pause_blocks_dispatch_and_cancels_workers() {
        let (_temp, s) = setup(r#"digraph demo { a [handler="codegen"]; c }"#);
        s.transition(TransitionRequest::new("a", NodeStatus::Active, Actor::scheduler()))
            .unwrap();

        let outcome = s.pause(&operator(), Some("maintenance".into())).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.cancelled, vec!["a"]);

        let inbox = s.signals().inbox("codegen").unwrap();
        let batch = inbox.receive().unwrap();
        assert_eq!(batch.received.len(), 1);
        assert_eq!(batch.received[0].signal.signal_type, "cancel");

        let err = s
            .transition(TransitionRequest::new("c", NodeStatus::Active, Actor::scheduler()))
            .unwrap_err();
        assert!(matches!(err, WardenError::Paused { .. }));

        assert!(!s.pause(&operator(), None).unwrap().changed);
        assert!(s.resume(&operator()).unwrap().changed);
        s.transition(TransitionRequest::new("c", NodeStatus::Active, Actor::scheduler()))
            .unwrap();
    }

    #[test]
    fn workers_cannot_pause() {
        let (_temp, s) = setup(PIPELINE);
        let err = s.pause(&implementer(), None).unwrap_err();
        assert!(matches!(
            err,
            WardenError::GuardRejected { reason: RejectReason::ForbiddenActor, .. }
        ));
        assert!(!s.graph().unwrap().is_paused());
    }

    #[test]
    fn edits_are_committed_and_audited() {
        let (_temp, s) = setup(PIPELINE);
        let (summary, info) = s
            .edit(&operator(), "node add c", |g| {
                g.add_node(crate::edit::NodeSpec::new("c", NodeKind::Task).after("b"), true)
            })
            .unwrap();
        assert_eq!(summary.nodes_added, vec!["c", "c_gate"]);
        assert_eq!(info.seq, 1);
        assert!(s.graph().unwrap().contains("c_gate"));

        let err = s
            .edit(&operator(), "edge add", |g| g.add_edge("b", "a", None, false))
            .unwrap_err();
        assert!(matches!(err, WardenError::CycleDetected { .. }));
        assert_eq!(s.store().checkpoints().latest_seq().unwrap(), Some(1));
    }

    #[test]
    fn health_reflects_progress() {
        let (_temp, s) = setup(PIPELINE);
        let report = s.health().unwrap();
        assert_eq!(report.dispatchable, 1);
        assert_eq!(report.blocked, 1);
        assert!(report.audit_entries.unwrap() >= 1);
    }
}
