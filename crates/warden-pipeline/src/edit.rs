//! Structural edits on a [`PipelineGraph`].
//!
//! Every operation works on a copy, validates the copy, and only then swaps
//! it in. A rejected edit leaves the graph exactly as it was.

use serde::Serialize;

use warden_dot::AttributeValue;
use warden_types::{NodeKind, Result, WardenError};

use crate::graph::{
    split_files, NodeMetadata, PipelineEdge, PipelineGraph, PipelineNode, LIFECYCLE_KEYS,
    RESERVED_NODE_KEYS,
};
use crate::validation::validate_or_raise;

/// Suffix of the verification gate paired with a task.
pub const GATE_SUFFIX: &str = "_gate";

pub fn gate_id_for(task_id: &str) -> String {
    format!("{task_id}{GATE_SUFFIX}")
}

/// A node to create.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    pub handler: Option<String>,
    pub max_retries: Option<u32>,
    pub meta: NodeMetadata,
    /// Existing nodes the new node depends on; an edge is added from each.
    pub after: Vec<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            handler: None,
            max_retries: None,
            meta: NodeMetadata::default(),
            after: Vec::new(),
        }
    }

    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.after.push(dep.into());
        self
    }
}

/// Attribute changes for [`PipelineGraph::modify_node`].
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub set: Vec<(String, AttributeValue)>,
    pub unset: Vec<String>,
}

impl NodePatch {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set.push((key.into(), value.into()));
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.unset.push(key.into());
        self
    }

    /// Parse a `key=value` assignment as typed on the command line.
    ///
    /// Integers, floats and `true`/`false` keep their type; everything else is a string.
    pub fn parse_assignment(text: &str) -> Result<(String, AttributeValue)> {
        let (key, value) = text.split_once('=').ok_or_else(|| WardenError::InvalidAttribute {
            owner: "patch".into(),
            key: text.into(),
            message: "expected key=value".into(),
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(WardenError::InvalidAttribute {
                owner: "patch".into(),
                key: String::new(),
                message: "empty attribute name".into(),
            });
        }
        let value = value.trim();
        let typed = if let Ok(i) = value.parse::<i64>() {
            AttributeValue::Integer(i)
        } else if let Some(f) = value
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && value.contains(|c: char| c.is_ascii_digit()))
        {
            AttributeValue::Float(f)
        } else if value == "true" || value == "false" {
            AttributeValue::Boolean(value == "true")
        } else {
            AttributeValue::String(value.to_string())
        };
        Ok((key.to_string(), typed))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// What a structural edit touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EditSummary {
    pub nodes_added: Vec<String>,
    pub nodes_removed: Vec<String>,
    pub edges_added: Vec<(String, String)>,
    pub edges_removed: Vec<(String, String)>,
}

fn check_open_key(node: &str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(WardenError::InvalidAttribute {
            owner: node.into(),
            key: key.into(),
            message: "empty attribute name".into(),
        });
    }
    if RESERVED_NODE_KEYS.contains(&key) {
        return Err(WardenError::InvalidAttribute {
            owner: node.into(),
            key: key.into(),
            message: "reserved attribute cannot be used as metadata".into(),
        });
    }
    Ok(())
}

fn text_value(value: &AttributeValue) -> String {
    match value {
        AttributeValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_set(node: &mut PipelineNode, key: &str, value: AttributeValue) -> Result<()> {
    match key {
        "id" | "kind" | "shape" => Err(WardenError::ImmutableField {
            node: node.id.clone(),
            field: key.into(),
        }),
        k if LIFECYCLE_KEYS.contains(&k) => Err(WardenError::ImmutableField {
            node: node.id.clone(),
            field: key.into(),
        }),
        "handler" => {
            node.handler = Some(text_value(&value));
            Ok(())
        }
        "max_retries" => {
            let max = value
                .as_i64()
                .and_then(|i| u32::try_from(i).ok())
                .ok_or_else(|| WardenError::InvalidAttribute {
                    owner: node.id.clone(),
                    key: key.into(),
                    message: format!("expected a non-negative integer, got '{value}'"),
                })?;
            node.max_retries = Some(max);
            Ok(())
        }
        "ticket" => {
            node.meta.ticket = Some(text_value(&value));
            Ok(())
        }
        "role" => {
            node.meta.role = Some(text_value(&value));
            Ok(())
        }
        "acceptance" => {
            node.meta.acceptance = Some(text_value(&value));
            Ok(())
        }
        "files" => {
            node.meta.files = split_files(&text_value(&value));
            Ok(())
        }
        "gate_type" => {
            node.meta.gate_type = Some(text_value(&value));
            Ok(())
        }
        other => {
            check_open_key(&node.id, other)?;
            node.meta.extra.insert(other.to_string(), value);
            Ok(())
        }
    }
}

fn apply_unset(node: &mut PipelineNode, key: &str) -> Result<()> {
    match key {
        "id" | "kind" | "shape" => Err(WardenError::ImmutableField {
            node: node.id.clone(),
            field: key.into(),
        }),
        k if LIFECYCLE_KEYS.contains(&k) => Err(WardenError::ImmutableField {
            node: node.id.clone(),
            field: key.into(),
        }),
        "handler" => {
            node.handler = None;
            Ok(())
        }
        "max_retries" => {
            node.max_retries = None;
            Ok(())
        }
        "ticket" => {
            node.meta.ticket = None;
            Ok(())
        }
        "role" => {
            node.meta.role = None;
            Ok(())
        }
        "acceptance" => {
            node.meta.acceptance = None;
            Ok(())
        }
        "files" => {
            node.meta.files.clear();
            Ok(())
        }
        "gate_type" => {
            node.meta.gate_type = None;
            Ok(())
        }
        other => {
            node.meta.extra.shift_remove(other);
            Ok(())
        }
    }
}

impl PipelineGraph {
    /// Run `op` on a copy; keep the copy only if it still validates.
    fn apply_edit<T>(&mut self, op: impl FnOnce(&mut PipelineGraph) -> Result<T>) -> Result<T> {
        let mut candidate = self.clone();
        let out = op(&mut candidate)?;
        validate_or_raise(&candidate)?;
        *self = candidate;
        Ok(out)
    }

    /// Add a node, with edges from each of `spec.after`.
    ///
    /// A `task` added with `auto_gate` also gets a paired `<id>_gate` gate and
    /// a `task -> gate` edge labelled `verify`.
    pub fn add_node(&mut self, spec: NodeSpec, auto_gate: bool) -> Result<EditSummary> {
        self.apply_edit(|g| {
            if spec.id.trim().is_empty() {
                return Err(WardenError::InvalidAttribute {
                    owner: "node".into(),
                    key: "id".into(),
                    message: "node id must not be empty".into(),
                });
            }
            if g.contains(&spec.id) {
                return Err(WardenError::DuplicateNode(spec.id.clone()));
            }
            for dep in &spec.after {
                if !g.contains(dep) {
                    return Err(WardenError::UnknownNode(dep.clone()));
                }
            }
            for key in spec.meta.extra.keys() {
                check_open_key(&spec.id, key)?;
            }

            let mut summary = EditSummary::default();
            let mut node = PipelineNode::new(spec.id.clone(), spec.kind);
            node.handler = spec.handler.clone();
            node.max_retries = spec.max_retries;
            node.meta = spec.meta.clone();
            g.insert_node(node);
            summary.nodes_added.push(spec.id.clone());

            for dep in &spec.after {
                if g.find_edge(dep, &spec.id).is_none() {
                    g.push_edge(PipelineEdge::new(dep.clone(), spec.id.clone()));
                    summary.edges_added.push((dep.clone(), spec.id.clone()));
                }
            }

            if auto_gate && spec.kind == NodeKind::Task {
                let gate_id = gate_id_for(&spec.id);
                if g.contains(&gate_id) {
                    return Err(WardenError::DuplicateNode(gate_id));
                }
                let mut gate = PipelineNode::new(gate_id.clone(), NodeKind::Gate);
                gate.handler = Some("verify".into());
                gate.meta.ticket = spec.meta.ticket.clone();
                g.insert_node(gate);
                g.push_edge(PipelineEdge::new(spec.id.clone(), gate_id.clone()).with_label("verify"));
                summary.nodes_added.push(gate_id.clone());
                summary.edges_added.push((spec.id.clone(), gate_id));
            }

            Ok(summary)
        })
        .inspect(|s| tracing::info!(nodes = ?s.nodes_added, "node added"))
    }

    /// Remove a node. Fails while edges remain unless `cascade`, which also
    /// removes those edges and the node's paired gate once it has nothing left
    /// to verify.
    pub fn remove_node(&mut self, id: &str, cascade: bool) -> Result<EditSummary> {
        self.apply_edit(|g| {
            if !g.contains(id) {
                return Err(WardenError::UnknownNode(id.into()));
            }
            let degree = g.degree(id);
            if degree > 0 && !cascade {
                return Err(WardenError::NodeHasEdges {
                    node: id.into(),
                    count: degree,
                });
            }

            let mut summary = EditSummary::default();
            remove_with_edges(g, id, &mut summary);

            let gate_id = gate_id_for(id);
            let orphaned_gate = g
                .node(&gate_id)
                .is_some_and(|n| n.kind == NodeKind::Gate)
                && g.incoming_edges(&gate_id).is_empty();
            if cascade && orphaned_gate {
                remove_with_edges(g, &gate_id, &mut summary);
            }
            Ok(summary)
        })
        .inspect(|s| tracing::info!(nodes = ?s.nodes_removed, edges = s.edges_removed.len(), "node removed"))
    }

    /// Change a node's handler or metadata. `id`, `kind` and lifecycle fields are immutable here.
    pub fn modify_node(&mut self, id: &str, patch: NodePatch) -> Result<()> {
        self.apply_edit(|g| {
            let node = g
                .node_mut(id)
                .ok_or_else(|| WardenError::UnknownNode(id.into()))?;
            for (key, value) in patch.set {
                apply_set(node, &key, value)?;
            }
            for key in &patch.unset {
                apply_unset(node, key)?;
            }
            Ok(())
        })?;
        tracing::info!(node = %id, "node modified");
        Ok(())
    }

    /// Add a dependency edge. An edge that would close a cycle is refused
    /// unless `allow_cycle`, in which case it is kept and flagged.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        label: Option<String>,
        allow_cycle: bool,
    ) -> Result<()> {
        self.apply_edit(|g| {
            for endpoint in [from, to] {
                if !g.contains(endpoint) {
                    return Err(WardenError::UnknownNode(endpoint.into()));
                }
            }
            if g.find_edge(from, to).is_some() {
                return Err(WardenError::DuplicateEdge {
                    from: from.into(),
                    to: to.into(),
                });
            }

            let mut edge = PipelineEdge::new(from, to);
            edge.label = label;
            if let Some(mut path) = g.find_path(to, from, true) {
                path.push(to.to_string());
                if !allow_cycle {
                    return Err(WardenError::CycleDetected {
                        from: from.into(),
                        to: to.into(),
                        path,
                    });
                }
                tracing::warn!(from = %from, to = %to, cycle = %path.join(" -> "), "cycle allowed by override");
                edge.cycle_override = true;
            }
            g.push_edge(edge);
            Ok(())
        })?;
        tracing::info!(from = %from, to = %to, "edge added");
        Ok(())
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> Result<()> {
        self.apply_edit(|g| {
            if g.find_edge(from, to).is_none() {
                return Err(WardenError::UnknownEdge {
                    from: from.into(),
                    to: to.into(),
                });
            }
            g.retain_edges(|e| !(e.from == from && e.to == to));
            Ok(())
        })?;
        tracing::info!(from = %from, to = %to, "edge removed");
        Ok(())
    }

    pub fn list_edges(&self, filter: &EdgeFilter) -> Vec<&PipelineEdge> {
        self.edges()
            .iter()
            .filter(|e| filter.from.as_ref().map_or(true, |f| &e.from == f))
            .filter(|e| filter.to.as_ref().map_or(true, |t| &e.to == t))
            .collect()
    }
}

fn remove_with_edges(g: &mut PipelineGraph, id: &str, summary: &mut EditSummary) {
    for e in g.edges() {
        if e.from == id || e.to == id {
            summary.edges_removed.push((e.from.clone(), e.to.clone()));
        }
    }
    g.retain_edges(|e| e.from != id && e.to != id);
    if g.take_node(id).is_some() {
        summary.nodes_removed.push(id.to_string());
    }
}
