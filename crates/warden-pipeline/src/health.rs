//! Read-only pipeline health.
//!
//! One label per pipeline, decided by the first matching rule in this order:
//! complete, paused, stale, stuck, warning, healthy.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use warden_audit::AuditSummary;
use warden_types::NodeStatus;

use crate::config::{window, WardenConfig};
use crate::graph::PipelineGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    Complete,
    Paused,
    Stale,
    Stuck,
    Warning,
    Healthy,
}

impl HealthLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLabel::Complete => "complete",
            HealthLabel::Paused => "paused",
            HealthLabel::Stale => "stale",
            HealthLabel::Stuck => "stuck",
            HealthLabel::Warning => "warning",
            HealthLabel::Healthy => "healthy",
        }
    }
}

impl fmt::Display for HealthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub staleness_window: Duration,
    pub retry_warning_threshold: u32,
}

impl HealthPolicy {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            staleness_window: window(config.staleness_window_secs),
            retry_warning_threshold: config.retry_warning_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub pipeline: String,
    pub label: HealthLabel,
    pub reason: String,
    pub revision: u64,
    pub nodes: usize,
    pub validated: usize,
    pub dispatchable: usize,
    /// Pending nodes that cannot start yet, plus failed nodes awaiting a retry.
    pub blocked: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub terminal: usize,
    pub max_retries_seen: u32,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub audit_entries: Option<u64>,
    pub last_audit_at: Option<String>,
}

/// Derive the health of `graph` at `now`. Pure: reads nothing else.
pub fn assess(
    graph: &PipelineGraph,
    audit: Option<&AuditSummary>,
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> HealthReport {
    let dispatchable = graph.dispatchable().len();
    let mut remaining = 0;
    let mut pending = 0;
    let mut in_flight = 0;
    let mut validated = 0;
    let mut failed = 0;
    let mut terminal = 0;
    let mut retrying = 0;
    let mut max_retries_seen = 0;

    for node in graph.nodes() {
        max_retries_seen = max_retries_seen.max(node.retries);
        match node.status {
            NodeStatus::Pending => {
                pending += 1;
                remaining += 1;
            }
            NodeStatus::Active | NodeStatus::ImplComplete => {
                in_flight += 1;
                remaining += 1;
            }
            NodeStatus::Validated => validated += 1,
            NodeStatus::Failed => {
                failed += 1;
                if node.terminal {
                    terminal += 1;
                } else {
                    retrying += 1;
                    remaining += 1;
                }
            }
        }
    }
    let blocked = (pending - dispatchable) + retrying;

    let checkpoint_at = graph.meta().checkpoint_at;
    let (label, reason) = if remaining == 0 {
        (
            HealthLabel::Complete,
            format!("no remaining work: {validated} validated, {terminal} terminally failed"),
        )
    } else if graph.is_paused() {
        (HealthLabel::Paused, "pipeline is administratively paused".to_string())
    } else if let Some(age) = checkpoint_at
        .map(|at| now - at)
        .filter(|age| *age > policy.staleness_window)
    {
        (
            HealthLabel::Stale,
            format!(
                "no checkpoint for {}s (window {}s)",
                age.num_seconds(),
                policy.staleness_window.num_seconds()
            ),
        )
    } else if blocked > 0 && dispatchable == 0 && in_flight == 0 {
        (
            HealthLabel::Stuck,
            format!("{blocked} blocked node(s), nothing dispatchable or in flight"),
        )
    } else if max_retries_seen >= policy.retry_warning_threshold && max_retries_seen > 0 {
        (
            HealthLabel::Warning,
            format!(
                "a node has retried {max_retries_seen} time(s) (threshold {})",
                policy.retry_warning_threshold
            ),
        )
    } else {
        (
            HealthLabel::Healthy,
            format!("{dispatchable} dispatchable, {in_flight} in flight"),
        )
    };

    HealthReport {
        pipeline: graph.name().to_string(),
        label,
        reason,
        revision: graph.revision(),
        nodes: graph.node_count(),
        validated,
        dispatchable,
        blocked,
        in_flight,
        failed,
        terminal,
        max_retries_seen,
        last_checkpoint_at: checkpoint_at,
        audit_entries: audit.map(|a| a.entries),
        last_audit_at: audit.and_then(|a| a.last_timestamp.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            staleness_window: Duration::hours(1),
            retry_warning_threshold: 2,
        }
    }

    fn label(src: &str, now: DateTime<Utc>) -> HealthLabel {
        let g = PipelineGraph::parse(src).unwrap();
        assess(&g, None, &policy(), now).label
    }

    const RECENT: &str = "2026-05-01T12:00:00.000000Z";

    fn soon() -> DateTime<Utc> {
        "2026-05-01T12:10:00Z".parse().unwrap()
    }

    fn much_later() -> DateTime<Utc> {
        "2026-05-03T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn oversized_staleness_window_is_capped() {
        let config = WardenConfig {
            staleness_window_secs: 10_000_000_000_000_000,
            ..WardenConfig::default()
        };
        let policy = HealthPolicy::from_config(&config);
        assert_eq!(
            policy.staleness_window,
            window(crate::config::MAX_WINDOW_SECS)
        );
    }

    #[test]
    fn all_validated_is_complete_even_when_stale() {
        let src = format!(
            r#"digraph p {{ graph [checkpoint_at="{RECENT}"] a [status=validated]; b [status=validated]; a -> b }}"#
        );
        assert_eq!(label(&src, much_later()), HealthLabel::Complete);
    }

    #[test]
    fn terminal_failures_count_as_settled() {
        let src = r#"digraph p { a [status=validated]; b [status=failed, terminal=true, retries=3] }"#;
        assert_eq!(label(src, soon()), HealthLabel::Complete);
    }

    #[test]
    fn paused_beats_stale() {
        let src = format!(r#"digraph p {{ graph [paused=true, checkpoint_at="{RECENT}"] a }}"#);
        assert_eq!(label(&src, much_later()), HealthLabel::Paused);
    }

    #[test]
    fn old_checkpoint_is_stale_not_warning() {
        let src = format!(
            r#"digraph p {{ graph [checkpoint_at="{RECENT}"] a [status=active, retries=5] }}"#
        );
        assert_eq!(label(&src, much_later()), HealthLabel::Stale);
    }

    #[test]
    fn missing_checkpoint_time_is_never_stale() {
        assert_eq!(label("digraph p { a }", much_later()), HealthLabel::Healthy);
    }

    #[test]
    fn blocked_with_nothing_moving_is_stuck() {
        let src = format!(
            r#"digraph p {{ graph [checkpoint_at="{RECENT}"] a [status=failed, terminal=true]; b; a -> b }}"#
        );
        let g = PipelineGraph::parse(&src).unwrap();
        let report = assess(&g, None, &policy(), soon());
        assert_eq!(report.label, HealthLabel::Stuck);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.terminal, 1);
    }

    #[test]
    fn waiting_on_a_worker_is_not_stuck() {
        let src = format!(
            r#"digraph p {{ graph [checkpoint_at="{RECENT}"] a [status=active]; b; a -> b }}"#
        );
        assert_eq!(label(&src, soon()), HealthLabel::Healthy);
    }

    #[test]
    fn retries_at_threshold_warn() {
        let src = format!(
            r#"digraph p {{ graph [checkpoint_at="{RECENT}"] a [status=active, retries=2] }}"#
        );
        assert_eq!(label(&src, soon()), HealthLabel::Warning);
    }

    #[test]
    fn report_carries_counts_and_audit() {
        let src = format!(
            r#"digraph p {{ graph [checkpoint_at="{RECENT}", revision=7]
                a [status=validated]; b; c [status=active]; d; a -> b; c -> d }}"#
        );
        let g = PipelineGraph::parse(&src).unwrap();
        let summary = AuditSummary {
            entries: 12,
            head_hash: "ab".into(),
            first_timestamp: None,
            last_timestamp: Some(RECENT.into()),
            by_action: Default::default(),
            by_actor: Default::default(),
        };
        let report = assess(&g, Some(&summary), &policy(), soon());
        assert_eq!(report.label, HealthLabel::Healthy);
        assert_eq!(report.revision, 7);
        assert_eq!(report.dispatchable, 1);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.audit_entries, Some(12));
    }
}
