//! Signal-driven scheduler loop.
//!
//! Each poll drains the scheduler inbox, applies what workers reported, then
//! dispatches whatever became runnable. Failed nodes are retried by the
//! dispatch pass, so every retry reaches a worker as a fresh `dispatch`.
//!
//! Signals are claimed one at a time, just before they are handled. A crash
//! or integrity failure mid-poll loses at most the signal being handled and
//! leaves the rest pending; no signal is ever applied twice.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use warden_signal::Signal;
use warden_types::{Actor, Evidence, NodeStatus, RejectReason, Result, Role, WardenError};

use crate::events::PipelineEvent;
use crate::graph::PipelineNode;
use crate::scheduler::{dispatch_target, Scheduler, TransitionRequest, SCHEDULER_INBOX};

/// What a worker puts in a `impl_complete`, `validated` or `failed` signal.
#[derive(Debug, Deserialize)]
struct NodeReport {
    node: String,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    evidence: Option<Evidence>,
    #[serde(default)]
    expect: Option<NodeStatus>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PauseRequest {
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    reason: Option<String>,
}

/// The sender is the actor. A payload `actor` may only repeat it.
fn actor_for(
    signal: &Signal,
    id: Option<String>,
    role: Option<Role>,
    default_role: Role,
) -> Result<Actor> {
    if let Some(claimed) = id.filter(|claimed| *claimed != signal.source) {
        return Err(WardenError::GuardRejected {
            node: signal
                .payload
                .get("node")
                .and_then(Value::as_str)
                .unwrap_or(SCHEDULER_INBOX)
                .to_string(),
            action: signal.signal_type.clone(),
            reason: RejectReason::ForbiddenActor,
            detail: format!("signal from '{}' claims to act as '{claimed}'", signal.source),
        });
    }
    Ok(Actor::new(signal.source.clone(), role.unwrap_or(default_role)))
}

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollReport {
    /// Signals taken from the inbox.
    pub consumed: usize,
    pub applied: usize,
    pub rejected: usize,
    /// `(node, target)` for every dispatch signal sent.
    pub dispatched: Vec<(String, String)>,
    /// Nodes that ran out of retries during this poll.
    pub exhausted: Vec<String>,
    /// Inbox files that could not be parsed.
    pub corrupt: Vec<String>,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.consumed == 0 && self.dispatched.is_empty() && self.corrupt.is_empty()
    }
}

#[derive(Clone)]
pub struct Watcher {
    scheduler: Scheduler,
}

impl Watcher {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// One pass: consume signals, then dispatch.
    ///
    /// Integrity failures (a broken audit chain, a corrupt checkpoint) stop the
    /// pass and are returned, leaving later signals in the inbox; everything
    /// else is answered with a `rejected` signal to the sender and the pass
    /// continues.
    pub fn poll_once(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        let inbox = self.scheduler.signals().inbox(SCHEDULER_INBOX)?;
        let corrupt = inbox.drain(|received| {
            let signal = received.signal;
            report.consumed += 1;
            self.scheduler.events().emit(PipelineEvent::SignalConsumed {
                signal_id: signal.id.clone(),
                signal_type: signal.signal_type.clone(),
                source: signal.source.clone(),
            });

            match self.handle(&signal) {
                Ok(()) => {
                    report.applied += 1;
                    Ok(())
                }
                Err(err) => {
                    report.rejected += 1;
                    self.reply_rejected(&signal, &err);
                    if err.is_integrity() {
                        Err(err)
                    } else {
                        Ok(())
                    }
                }
            }
        })?;
        report.corrupt = corrupt.iter().map(|e| e.to_string()).collect();

        self.dispatch(&mut report)?;
        Ok(report)
    }

    fn handle(&self, signal: &Signal) -> Result<()> {
        tracing::debug!(id = %signal.id, signal_type = %signal.signal_type, source = %signal.source, "handling signal");
        match signal.signal_type.as_str() {
            "impl_complete" => self.apply_report(signal, NodeStatus::ImplComplete, Role::Implementer),
            "validated" => self.apply_report(signal, NodeStatus::Validated, Role::Validator),
            "failed" => {
                let r = parse_payload::<NodeReport>(signal)?;
                let actor = actor_for(signal, r.actor, r.role, Role::Implementer)?;
                self.scheduler
                    .fail(&r.node, actor, r.reason, r.evidence)
                    .map(|_| ())
            }
            "pause" | "resume" => {
                let r = if signal.payload.is_null() {
                    PauseRequest::default()
                } else {
                    parse_payload::<PauseRequest>(signal)?
                };
                let actor = actor_for(signal, r.actor, r.role, Role::Operator)?;
                if signal.signal_type == "pause" {
                    self.scheduler.pause(&actor, r.reason)?;
                } else {
                    self.scheduler.resume(&actor)?;
                }
                Ok(())
            }
            other => Err(WardenError::Other(format!("unsupported signal type '{other}'"))),
        }
    }

    fn apply_report(&self, signal: &Signal, to: NodeStatus, default_role: Role) -> Result<()> {
        let r = parse_payload::<NodeReport>(signal)?;
        let mut req = TransitionRequest::new(
            r.node.clone(),
            to,
            actor_for(signal, r.actor, r.role, default_role)?,
        );
        req.expected = r.expect;
        req.evidence = r.evidence;
        req.reason = r.reason;
        self.scheduler.transition(req).map(|_| ())
    }

    fn reply_rejected(&self, signal: &Signal, err: &WardenError) {
        let reason = match err {
            WardenError::GuardRejected { reason, .. } => Some(reason.as_str()),
            _ => None,
        };
        let payload = json!({
            "node": signal.payload.get("node"),
            "signal": signal.id,
            "error": err.to_string(),
            "category": format!("{:?}", err.category()).to_lowercase(),
            "reason": reason,
        });
        tracing::warn!(id = %signal.id, source = %signal.source, error = %err, "signal rejected");
        if let Err(e) = self
            .scheduler
            .signals()
            .send(SCHEDULER_INBOX, &signal.source, "rejected", payload)
        {
            tracing::warn!(source = %signal.source, error = %e, "could not deliver rejection");
        }
    }

    /// Start every runnable node and tell its worker. Retries failed nodes
    /// first when `auto_retry` is on. Nothing is dispatched while paused.
    fn dispatch(&self, report: &mut PollReport) -> Result<()> {
        let graph = self.scheduler.graph()?;
        if graph.is_paused() {
            tracing::debug!("pipeline paused; not dispatching");
            return Ok(());
        }

        let mut candidates: Vec<PipelineNode> = Vec::new();
        if self.scheduler.config().auto_retry {
            candidates.extend(
                graph
                    .nodes()
                    .filter(|n| n.status == NodeStatus::Failed && !n.terminal)
                    .cloned(),
            );
        }
        candidates.extend(graph.dispatchable().into_iter().cloned());

        for node in candidates {
            let from = node.status;
            let outcome = self.scheduler.transition(
                TransitionRequest::new(node.id.clone(), NodeStatus::Active, Actor::scheduler())
                    .expect_status(from),
            );
            let receipt = match outcome {
                Ok(receipt) => receipt,
                Err(
                    e @ (WardenError::StatusConflict { .. }
                    | WardenError::NotDispatchable { .. }
                    | WardenError::Paused { .. }),
                ) => {
                    tracing::debug!(node = %node.id, error = %e, "skipped dispatch");
                    continue;
                }
                Err(WardenError::RetriesExhausted { .. }) => {
                    report.exhausted.push(node.id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let attempt = node.retries + if from == NodeStatus::Failed { 2 } else { 1 };
            let target = dispatch_target(&node);
            let payload = json!({
                "node": node.id,
                "handler": node.handler,
                "kind": node.kind,
                "ticket": node.meta.ticket,
                "acceptance": node.meta.acceptance,
                "files": node.meta.files,
                "attempt": attempt,
                "revision": receipt.revision,
            });
            self.scheduler
                .signals()
                .send(SCHEDULER_INBOX, &target, "dispatch", payload)?;
            tracing::info!(node = %node.id, target = %target, attempt, "dispatched");
            self.scheduler.events().emit(PipelineEvent::NodeDispatched {
                node_id: node.id.clone(),
                target: target.clone(),
            });
            report.dispatched.push((node.id, target));
        }
        Ok(())
    }

    /// Poll every `poll_interval` until `shutdown` turns true or its sender is
    /// dropped. Stops with an error on an integrity failure.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.scheduler.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            pipeline = %self.scheduler.store().pipeline_id(),
            interval_ms = self.scheduler.config().poll_interval_ms,
            "watcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let watcher = self.clone();
            let outcome = tokio::task::spawn_blocking(move || watcher.poll_once())
                .await
                .map_err(|e| WardenError::Other(format!("poll task failed: {e}")))?;
            match outcome {
                Ok(report) if !report.is_idle() => tracing::info!(
                    consumed = report.consumed,
                    applied = report.applied,
                    rejected = report.rejected,
                    dispatched = report.dispatched.len(),
                    "poll"
                ),
                Ok(_) => {}
                Err(e) if e.is_integrity() => {
                    tracing::error!(error = %e, "integrity failure; watcher stopping");
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "poll failed; will retry"),
            }
        }

        tracing::info!("watcher stopped");
        Ok(())
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(signal: &Signal) -> Result<T> {
    serde_json::from_value(signal.payload.clone()).map_err(|e| {
        WardenError::Other(format!(
            "bad '{}' payload in signal {}: {e}",
            signal.signal_type, signal.id
        ))
    })
}
