//! Guard rails evaluated before any status change is committed.
//!
//! Checks run in a fixed order and the first failure decides the outcome:
//! role table, self-certification, retry limit, evidence presence, evidence
//! age, confidence, spot-check. Every decision, pass or fail, is appended to
//! the audit log before it is returned.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use warden_audit::AuditLog;
use warden_types::{Actor, Evidence, NodeStatus, RejectReason, Result, Role, WardenError};

use crate::config::{window, GuardConfig};
use crate::graph::PipelineNode;

pub const GUARD_ACTION: &str = "guard.evaluate";

/// Roles allowed to request `from -> to`. Empty for transitions outside the table.
pub fn allowed_roles(from: NodeStatus, to: NodeStatus) -> &'static [Role] {
    use NodeStatus::*;
    match (from, to) {
        (Pending, Active) => &[Role::Scheduler, Role::Operator],
        (Active, ImplComplete) => &[Role::Implementer],
        (Active, Failed) => &[Role::Implementer, Role::Scheduler, Role::Operator],
        (ImplComplete, Validated) => &[Role::Validator],
        (ImplComplete, Failed) => &[Role::Validator, Role::Operator],
        (Failed, Active) => &[Role::Scheduler, Role::Operator],
        _ => &[],
    }
}

/// Deterministic sampling: `sha256(session ‖ 0x1f ‖ node)`, first 8 bytes as a
/// big-endian integer, selected when below `rate × 2^64`.
pub fn spot_check_selected(session_id: &str, node_id: &str, rate: f64) -> bool {
    if rate.is_nan() || rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(node_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(prefix);
    let threshold = (rate * 18_446_744_073_709_551_616.0) as u128;
    u128::from(value) < threshold
}

/// Everything the guard needs to judge one requested transition.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub node: &'a PipelineNode,
    pub to: NodeStatus,
    pub actor: &'a Actor,
    pub evidence: Option<&'a Evidence>,
    pub session: &'a str,
    /// Effective retry limit for this node.
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    pub detail: String,
    pub spot_check_selected: bool,
}

impl GuardDecision {
    fn allow(spot_check_selected: bool) -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: "all checks passed".into(),
            spot_check_selected,
        }
    }

    fn reject(reason: RejectReason, detail: impl Into<String>, spot_check_selected: bool) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail: detail.into(),
            spot_check_selected,
        }
    }

    /// `Ok` when allowed, otherwise the matching [`WardenError::GuardRejected`].
    pub fn into_result(self, node: &str, to: NodeStatus) -> Result<Self> {
        match self.reason {
            Some(reason) if !self.allowed => Err(WardenError::GuardRejected {
                node: node.to_string(),
                action: format!("transition to {to}"),
                reason,
                detail: self.detail,
            }),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardRails {
    config: GuardConfig,
}

impl GuardRails {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Judge a transition without recording anything.
    pub fn check(&self, ctx: &GuardContext<'_>, now: DateTime<Utc>) -> GuardDecision {
        let node = ctx.node;
        let from = node.status;
        let to = ctx.to;

        let sampled = to == NodeStatus::Validated
            && spot_check_selected(ctx.session, &node.id, self.config.spot_check_rate);

        let roles = allowed_roles(from, to);
        if !roles.contains(&ctx.actor.role) {
            return GuardDecision::reject(
                RejectReason::ForbiddenActor,
                format!("{} may not move {} from {from} to {to}", ctx.actor, node.id),
                sampled,
            );
        }

        if to == NodeStatus::Validated {
            if let Some(claimant) = node.claimed_by.as_deref() {
                let evidence_author = ctx.evidence.map(|e| e.actor.as_str());
                if ctx.actor.id == claimant || evidence_author == Some(claimant) {
                    return GuardDecision::reject(
                        RejectReason::SelfCertification,
                        format!("'{claimant}' claimed this work and cannot also certify it"),
                        sampled,
                    );
                }
            }
        }

        if from == NodeStatus::Failed && to == NodeStatus::Active {
            if node.terminal || node.retries >= ctx.max_retries {
                return GuardDecision::reject(
                    RejectReason::RetryLimitExceeded,
                    format!("{} of {} retries used", node.retries, ctx.max_retries),
                    sampled,
                );
            }
        }

        let needs_evidence = matches!(to, NodeStatus::ImplComplete | NodeStatus::Validated);
        let evidence = match ctx.evidence {
            Some(e) => Some(e),
            None if needs_evidence && self.config.require_evidence => {
                return GuardDecision::reject(
                    RejectReason::MissingEvidence,
                    format!("transition to {to} requires evidence"),
                    sampled,
                );
            }
            None => None,
        };

        if let Some(evidence) = evidence {
            let skew = window(self.config.max_clock_skew_secs);
            let max_age = window(self.config.max_evidence_age_secs);
            if evidence.produced_at > now + skew {
                return GuardDecision::reject(
                    RejectReason::FutureEvidence,
                    format!("evidence produced_at {} is in the future", evidence.produced_at),
                    sampled,
                );
            }
            let age = now - evidence.produced_at;
            if age > max_age {
                return GuardDecision::reject(
                    RejectReason::StaleEvidence,
                    format!(
                        "evidence is {}s old, limit is {}s",
                        age.num_seconds(),
                        max_age.num_seconds()
                    ),
                    sampled,
                );
            }
            if let Some(confidence) = evidence.confidence {
                if confidence.is_nan() || confidence < self.config.min_confidence {
                    return GuardDecision::reject(
                        RejectReason::LowConfidence,
                        format!(
                            "confidence {confidence} below minimum {}",
                            self.config.min_confidence
                        ),
                        sampled,
                    );
                }
            }
        }

        if sampled {
            match evidence.and_then(|e| e.deep_verification) {
                Some(true) => {}
                Some(false) => {
                    return GuardDecision::reject(
                        RejectReason::SpotCheckFailed,
                        "selected for spot-check and deep verification failed",
                        sampled,
                    );
                }
                None => {
                    return GuardDecision::reject(
                        RejectReason::SpotCheckRequired,
                        "selected for spot-check; deep verification result required",
                        sampled,
                    );
                }
            }
        }

        GuardDecision::allow(sampled)
    }

    /// Judge a transition and append the decision to `audit` before returning it.
    pub fn evaluate(
        &self,
        ctx: &GuardContext<'_>,
        now: DateTime<Utc>,
        audit: &AuditLog,
    ) -> Result<GuardDecision> {
        let decision = self.check(ctx, now);
        let payload = json!({
            "node": ctx.node.id,
            "from": ctx.node.status,
            "to": ctx.to,
            "role": ctx.actor.role,
            "allowed": decision.allowed,
            "reason": decision.reason,
            "detail": decision.detail,
            "spot_check_selected": decision.spot_check_selected,
            "evidence": ctx.evidence,
        });
        let hash = audit.append(&ctx.actor.id, GUARD_ACTION, payload)?;

        if decision.allowed {
            tracing::debug!(node = %ctx.node.id, to = %ctx.to, entry_hash = %hash, "guard passed");
        } else {
            tracing::warn!(
                node = %ctx.node.id,
                to = %ctx.to,
                actor = %ctx.actor,
                reason = ?decision.reason,
                detail = %decision.detail,
                "guard rejected transition"
            );
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use warden_types::NodeKind;

    fn node(status: NodeStatus) -> PipelineNode {
        let mut n = PipelineNode::new("build", NodeKind::Task);
        n.status = status;
        n
    }

    fn rails() -> GuardRails {
        GuardRails::new(GuardConfig {
            spot_check_rate: 0.0,
            ..GuardConfig::default()
        })
    }

    fn implementer() -> Actor {
        Actor::new("worker-1", Role::Implementer)
    }

    fn validator() -> Actor {
        Actor::new("checker-1", Role::Validator)
    }

    fn ctx<'a>(
        node: &'a PipelineNode,
        to: NodeStatus,
        actor: &'a Actor,
        evidence: Option<&'a Evidence>,
    ) -> GuardContext<'a> {
        GuardContext {
            node,
            to,
            actor,
            evidence,
            session: "session-1",
            max_retries: 3,
        }
    }

    #[test]
    fn role_table_matches_lifecycle() {
        assert_eq!(
            allowed_roles(NodeStatus::ImplComplete, NodeStatus::Validated),
            &[Role::Validator]
        );
        assert!(allowed_roles(NodeStatus::Pending, NodeStatus::Validated).is_empty());
        for from in NodeStatus::ALL {
            for to in NodeStatus::ALL {
                if !from.can_transition_to(to) {
                    assert!(allowed_roles(from, to).is_empty(), "{from} -> {to}");
                } else {
                    assert!(!allowed_roles(from, to).is_empty(), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn implementer_cannot_validate() {
        let n = node(NodeStatus::ImplComplete);
        let actor = implementer();
        let ev = Evidence::new("worker-1", Utc::now());
        let d = rails().check(&ctx(&n, NodeStatus::Validated, &actor, Some(&ev)), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::ForbiddenActor));
    }

    #[test]
    fn claimant_cannot_certify_own_work() {
        let mut n = node(NodeStatus::ImplComplete);
        n.claimed_by = Some("checker-1".into());
        let actor = validator();
        let ev = Evidence::new("checker-1", Utc::now());
        let d = rails().check(&ctx(&n, NodeStatus::Validated, &actor, Some(&ev)), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::SelfCertification));
    }

    #[test]
    fn evidence_authored_by_claimant_is_self_certification() {
        let mut n = node(NodeStatus::ImplComplete);
        n.claimed_by = Some("worker-1".into());
        let actor = validator();
        let ev = Evidence::new("worker-1", Utc::now());
        let d = rails().check(&ctx(&n, NodeStatus::Validated, &actor, Some(&ev)), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::SelfCertification));
    }

    #[test]
    fn independent_validator_passes() {
        let mut n = node(NodeStatus::ImplComplete);
        n.claimed_by = Some("worker-1".into());
        let actor = validator();
        let ev = Evidence::new("checker-1", Utc::now()).with_confidence(0.9);
        let d = rails().check(&ctx(&n, NodeStatus::Validated, &actor, Some(&ev)), Utc::now());
        assert!(d.allowed, "{d:?}");
        assert_eq!(d.reason, None);
    }

    #[test]
    fn retry_limit_blocks_reentry() {
        let mut n = node(NodeStatus::Failed);
        n.retries = 3;
        let actor = Actor::scheduler();
        let d = rails().check(&ctx(&n, NodeStatus::Active, &actor, None), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::RetryLimitExceeded));

        n.retries = 2;
        let d = rails().check(&ctx(&n, NodeStatus::Active, &actor, None), Utc::now());
        assert!(d.allowed);

        n.terminal = true;
        let d = rails().check(&ctx(&n, NodeStatus::Active, &actor, None), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::RetryLimitExceeded));
    }

    #[test]
    fn completion_requires_evidence() {
        let n = node(NodeStatus::Active);
        let actor = implementer();
        let d = rails().check(&ctx(&n, NodeStatus::ImplComplete, &actor, None), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::MissingEvidence));

        let lenient = GuardRails::new(GuardConfig {
            require_evidence: false,
            spot_check_rate: 0.0,
            ..GuardConfig::default()
        });
        let d = lenient.check(&ctx(&n, NodeStatus::ImplComplete, &actor, None), Utc::now());
        assert!(d.allowed);
    }

    #[test]
    fn ten_day_old_evidence_is_stale() {
        let n = node(NodeStatus::Active);
        let actor = implementer();
        let now = Utc::now();
        let ev = Evidence::new("worker-1", now - Duration::days(10));
        let d = rails().check(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&ev)), now);
        assert_eq!(d.reason, Some(RejectReason::StaleEvidence));
        assert_eq!(d.reason.map(|r| r.as_str()), Some("stale_evidence"));
    }

    #[test]
    fn future_evidence_beyond_skew_is_rejected() {
        let n = node(NodeStatus::Active);
        let actor = implementer();
        let now = Utc::now();

        let slightly = Evidence::new("worker-1", now + Duration::seconds(30));
        assert!(rails()
            .check(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&slightly)), now)
            .allowed);

        let far = Evidence::new("worker-1", now + Duration::hours(2));
        let d = rails().check(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&far)), now);
        assert_eq!(d.reason, Some(RejectReason::FutureEvidence));
    }

    #[test]
    fn low_confidence_is_rejected() {
        let strict = GuardRails::new(GuardConfig {
            min_confidence: 0.8,
            spot_check_rate: 0.0,
            ..GuardConfig::default()
        });
        let n = node(NodeStatus::Active);
        let actor = implementer();
        let ev = Evidence::new("worker-1", Utc::now()).with_confidence(0.5);
        let d = strict.check(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&ev)), Utc::now());
        assert_eq!(d.reason, Some(RejectReason::LowConfidence));
    }

    #[test]
    fn spot_check_overrides_passing_evidence() {
        let always = GuardRails::new(GuardConfig {
            spot_check_rate: 1.0,
            ..GuardConfig::default()
        });
        let n = node(NodeStatus::ImplComplete);
        let actor = validator();
        let now = Utc::now();

        let plain = Evidence::new("checker-1", now).with_confidence(1.0);
        let d = always.check(&ctx(&n, NodeStatus::Validated, &actor, Some(&plain)), now);
        assert_eq!(d.reason, Some(RejectReason::SpotCheckRequired));
        assert!(d.spot_check_selected);

        let failed = plain.clone().with_deep_verification(false);
        let d = always.check(&ctx(&n, NodeStatus::Validated, &actor, Some(&failed)), now);
        assert_eq!(d.reason, Some(RejectReason::SpotCheckFailed));

        let passed = plain.with_deep_verification(true);
        let d = always.check(&ctx(&n, NodeStatus::Validated, &actor, Some(&passed)), now);
        assert!(d.allowed);
        assert!(d.spot_check_selected);
    }

    #[test]
    fn spot_check_only_applies_to_validation() {
        let always = GuardRails::new(GuardConfig {
            spot_check_rate: 1.0,
            ..GuardConfig::default()
        });
        let n = node(NodeStatus::Active);
        let actor = implementer();
        let ev = Evidence::new("worker-1", Utc::now());
        let d = always.check(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&ev)), Utc::now());
        assert!(d.allowed);
        assert!(!d.spot_check_selected);
    }

    #[test]
    fn sampling_rate_bounds() {
        assert!(!spot_check_selected("s", "n", 0.0));
        assert!(spot_check_selected("s", "n", 1.0));
        assert!(!spot_check_selected("s", "n", f64::NAN));
    }

    #[test]
    fn sampling_rate_is_roughly_honoured() {
        let selected = (0..2000)
            .filter(|i| spot_check_selected("session-x", &format!("node-{i}"), 0.25))
            .count();
        assert!((350..650).contains(&selected), "selected {selected} of 2000");
    }

    #[test]
    fn evaluate_audits_pass_and_fail() {
        let temp = tempfile::tempdir().unwrap();
        let audit = AuditLog::open(temp.path().join("audit.jsonl")).unwrap();
        let n = node(NodeStatus::Active);
        let actor = implementer();
        let now = Utc::now();

        let stale = Evidence::new("worker-1", now - Duration::days(10));
        let d = rails()
            .evaluate(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&stale)), now, &audit)
            .unwrap();
        assert!(!d.allowed);

        let fresh = Evidence::new("worker-1", now);
        let d = rails()
            .evaluate(&ctx(&n, NodeStatus::ImplComplete, &actor, Some(&fresh)), now, &audit)
            .unwrap();
        assert!(d.allowed);

        let entries = audit.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == GUARD_ACTION && e.actor == "worker-1"));
        assert_eq!(entries[0].payload["reason"], "stale_evidence");
        assert_eq!(entries[0].payload["allowed"], false);
        assert!(entries[1].payload["reason"].is_null());
        audit.verify_chain().unwrap();
    }

    #[test]
    fn rejection_maps_to_policy_error() {
        let d = GuardDecision::reject(RejectReason::StaleEvidence, "old", false);
        let err = d.into_result("y", NodeStatus::ImplComplete).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(matches!(
            err,
            WardenError::GuardRejected { reason: RejectReason::StaleEvidence, .. }
        ));
    }

    proptest! {
        #[test]
        fn spot_check_is_pure(session in "[a-z0-9-]{1,24}", node in "[a-z_]{1,16}", rate in 0.0f64..=1.0) {
            let first = spot_check_selected(&session, &node, rate);
            let second = spot_check_selected(&session, &node, rate);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn spot_check_is_monotonic_in_rate(session in "[a-z0-9-]{1,24}", node in "[a-z_]{1,16}", low in 0.0f64..=1.0, high in 0.0f64..=1.0) {
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            if spot_check_selected(&session, &node, low) {
                prop_assert!(spot_check_selected(&session, &node, high));
            }
        }
    }
}
