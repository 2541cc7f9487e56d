//! Pipeline validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on any `Error`-severity issue. Every edit operation runs
//! [`validate_or_raise`] on its candidate graph before the change is kept.

use std::collections::HashSet;

use serde::Serialize;

use warden_types::{NodeKind, NodeStatus, Result, WardenError};

use crate::graph::PipelineGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct EdgeEndpointsExistRule;
impl LintRule for EdgeEndpointsExistRule {
    fn name(&self) -> &str {
        "edge_endpoints_exist"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for e in graph.edges() {
            for endpoint in [&e.from, &e.to] {
                if !graph.contains(endpoint) {
                    out.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Edge {} -> {} references non-existent node '{}'",
                            e.from, e.to, endpoint
                        ),
                        node_id: None,
                        edge: Some((e.from.clone(), e.to.clone())),
                        fix: Some(format!("Add node '{endpoint}' or remove the edge")),
                    });
                }
            }
        }
        out
    }
}

struct DuplicateEdgeRule;
impl LintRule for DuplicateEdgeRule {
    fn name(&self) -> &str {
        "duplicate_edge"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        graph
            .edges()
            .iter()
            .filter(|e| !seen.insert((e.from.as_str(), e.to.as_str())))
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Edge {} -> {} is declared more than once", e.from, e.to),
                node_id: None,
                edge: Some((e.from.clone(), e.to.clone())),
                fix: Some("Keep a single edge between each pair of nodes".into()),
            })
            .collect()
    }
}

struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str {
        "acyclic"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if let Some(cycle) = graph.find_cycle(true) {
            return vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Cycle detected: {}", cycle.join(" -> ")),
                node_id: cycle.first().cloned(),
                edge: None,
                fix: Some("Remove an edge on the cycle or mark it cycle_override=true".into()),
            }];
        }
        match graph.find_cycle(false) {
            Some(cycle) => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Cycle allowed by override: {}", cycle.join(" -> ")),
                node_id: cycle.first().cloned(),
                edge: None,
                fix: None,
            }],
            None => vec![],
        }
    }
}

struct OrphanedGateRule;
impl LintRule for OrphanedGateRule {
    fn name(&self) -> &str {
        "orphaned_gate"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| n.kind == NodeKind::Gate)
            .filter(|n| graph.incoming_edges(&n.id).is_empty())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Gate '{}' has nothing to verify (no incoming edges)", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("Add an edge into '{}' or remove it", n.id)),
            })
            .collect()
    }
}

struct SingleStartRule;
impl LintRule for SingleStartRule {
    fn name(&self) -> &str {
        "single_start"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph.nodes().filter(|n| n.kind == NodeKind::Start).collect();
        if starts.len() > 1 {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Pipeline has {} start nodes: {}; expected at most one",
                    starts.len(),
                    starts.iter().map(|n| n.id.as_str()).collect::<Vec<_>>().join(", ")
                ),
                node_id: None,
                edge: None,
                fix: Some("Remove extra start nodes so only one remains".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| n.kind == NodeKind::Start)
            .filter(|n| !graph.incoming_edges(&n.id).is_empty())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Start node '{}' has incoming edges", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("Remove edges pointing to the start node".into()),
            })
            .collect()
    }
}

struct ExitNoOutgoingRule;
impl LintRule for ExitNoOutgoingRule {
    fn name(&self) -> &str {
        "exit_no_outgoing"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| n.kind == NodeKind::Exit)
            .filter(|n| !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Exit node '{}' has outgoing edges", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("Remove outgoing edges from '{}'", n.id)),
            })
            .collect()
    }
}

/// Work that started before its dependencies were validated, or a terminal flag
/// on a node that is not failed. Usually the result of a hand edit.
struct StatusConsistencyRule;
impl LintRule for StatusConsistencyRule {
    fn name(&self) -> &str {
        "status_consistency"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in graph.nodes() {
            if n.status != NodeStatus::Pending && !graph.deps_met(&n.id) {
                out.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!(
                        "Node '{}' is {} but not all of its dependencies are validated",
                        n.id, n.status
                    ),
                    node_id: Some(n.id.clone()),
                    edge: None,
                    fix: None,
                });
            }
            if n.terminal && n.status != NodeStatus::Failed {
                out.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!("Node '{}' is marked terminal but is {}", n.id, n.status),
                    node_id: Some(n.id.clone()),
                    edge: None,
                    fix: Some("Set status=failed or drop terminal=true".into()),
                });
            }
        }
        out
    }
}

struct RetryBudgetRule;
impl LintRule for RetryBudgetRule {
    fn name(&self) -> &str {
        "retry_budget"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter_map(|n| n.max_retries.filter(|max| n.retries > *max).map(|max| (n, max)))
            .map(|(n, max)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Node '{}' has retried {} times, over its limit of {}",
                    n.id, n.retries, max
                ),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(EdgeEndpointsExistRule),
        Box::new(DuplicateEdgeRule),
        Box::new(AcyclicRule),
        Box::new(OrphanedGateRule),
        Box::new(SingleStartRule),
        Box::new(StartNoIncomingRule),
        Box::new(ExitNoOutgoingRule),
        Box::new(StatusConsistencyRule),
        Box::new(RetryBudgetRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &PipelineGraph) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(WardenError::ValidationError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
