use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use warden_dot::{AttributeValue, Attrs, DotGraph, EdgeDef, NodeDef};
use warden_types::{NodeKind, NodeStatus, Result, WardenError};

/// A pipeline: typed nodes and dependency edges plus graph-level metadata.
///
/// Fields are private. Reads go through accessors; structural changes go
/// through the edit operations in [`crate::edit`], lifecycle changes through
/// the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineGraph {
    name: String,
    meta: GraphMeta,
    nodes: IndexMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphMeta {
    pub ticket: Option<String>,
    pub workspace: Option<String>,
    pub session: Option<String>,
    pub paused: bool,
    /// Bumped on every committed mutation.
    pub revision: u64,
    pub checkpoint_seq: Option<u64>,
    pub checkpoint_at: Option<DateTime<Utc>>,
    pub extra: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineNode {
    pub id: String,
    pub kind: NodeKind,
    pub handler: Option<String>,
    pub status: NodeStatus,
    /// Successful re-entries into `active` after a failure.
    pub retries: u32,
    /// Per-node override of the configured retry limit.
    pub max_retries: Option<u32>,
    /// Permanently failed; never re-enters `active`.
    pub terminal: bool,
    /// Actor that claimed `impl_complete`.
    pub claimed_by: Option<String>,
    /// Refused transition attempts.
    pub rejected_attempts: u32,
    pub updated_at: Option<DateTime<Utc>>,
    pub meta: NodeMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeMetadata {
    pub ticket: Option<String>,
    pub role: Option<String>,
    pub acceptance: Option<String>,
    pub files: Vec<String>,
    pub gate_type: Option<String>,
    /// Open metadata: every attribute without a typed meaning.
    pub extra: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    /// Explicitly allowed to close a cycle. Overridden edges do not gate dispatch.
    pub cycle_override: bool,
    pub extra: Attrs,
}

/// Node and graph attributes that carry typed meaning and cannot be used as open metadata.
pub const RESERVED_NODE_KEYS: &[&str] = &[
    "id",
    "kind",
    "shape",
    "handler",
    "status",
    "retries",
    "max_retries",
    "terminal",
    "claimed_by",
    "rejected_attempts",
    "updated_at",
    "ticket",
    "role",
    "acceptance",
    "files",
    "gate_type",
];

/// Keys only the scheduler may write.
pub const LIFECYCLE_KEYS: &[&str] = &[
    "status",
    "retries",
    "terminal",
    "claimed_by",
    "rejected_attempts",
    "updated_at",
];

impl PipelineNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            handler: None,
            status: NodeStatus::Pending,
            retries: 0,
            max_retries: None,
            terminal: false,
            claimed_by: None,
            rejected_attempts: 0,
            updated_at: None,
            meta: NodeMetadata::default(),
        }
    }

    pub fn retry_limit(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }
}

impl PipelineEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            cycle_override: false,
            extra: Attrs::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

// --- Attribute extraction helpers ---

fn invalid(owner: &str, key: &str, message: impl Into<String>) -> WardenError {
    WardenError::InvalidAttribute {
        owner: owner.to_string(),
        key: key.to_string(),
        message: message.into(),
    }
}

fn take_text(attrs: &mut Attrs, key: &str) -> Option<String> {
    attrs.shift_remove(key).map(|v| match v {
        AttributeValue::String(s) => s,
        other => other.to_string(),
    })
}

fn take_u32(attrs: &mut Attrs, owner: &str, key: &str) -> Result<Option<u32>> {
    match attrs.shift_remove(key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| invalid(owner, key, format!("expected a non-negative integer, got '{v}'"))),
    }
}

fn take_u64(attrs: &mut Attrs, owner: &str, key: &str) -> Result<Option<u64>> {
    match attrs.shift_remove(key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| invalid(owner, key, format!("expected a non-negative integer, got '{v}'"))),
    }
}

fn take_bool(attrs: &mut Attrs, owner: &str, key: &str) -> Result<Option<bool>> {
    match attrs.shift_remove(key) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(owner, key, format!("expected true or false, got '{v}'"))),
    }
}

fn take_time(attrs: &mut Attrs, owner: &str, key: &str) -> Result<Option<DateTime<Utc>>> {
    match take_text(attrs, key) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| invalid(owner, key, format!("expected an RFC 3339 timestamp: {e}"))),
    }
}

pub(crate) fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn split_files(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// --- Conversions ---

fn node_from_def(def: &NodeDef) -> Result<PipelineNode> {
    let id = def.id.as_str();
    let mut attrs = def.attrs.clone();

    let shape = take_text(&mut attrs, "shape");
    let explicit = take_text(&mut attrs, "kind");
    let kind = match (explicit, shape) {
        (Some(k), shape) => {
            let kind: NodeKind = k
                .parse()
                .map_err(|_| invalid(id, "kind", format!("unknown node kind '{k}'")))?;
            if let Some(shape) = shape {
                if NodeKind::from_shape(&shape) != Some(kind) {
                    return Err(invalid(
                        id,
                        "shape",
                        format!("shape '{shape}' contradicts kind '{kind}'"),
                    ));
                }
            }
            kind
        }
        (None, Some(shape)) => NodeKind::from_shape(&shape)
            .ok_or_else(|| invalid(id, "shape", format!("unknown shape '{shape}'")))?,
        (None, None) => NodeKind::Task,
    };

    let status = match take_text(&mut attrs, "status") {
        Some(s) => s
            .parse()
            .map_err(|_| invalid(id, "status", format!("unknown status '{s}'")))?,
        None => NodeStatus::Pending,
    };

    let handler = take_text(&mut attrs, "handler");
    let retries = take_u32(&mut attrs, id, "retries")?.unwrap_or(0);
    let max_retries = take_u32(&mut attrs, id, "max_retries")?;
    let terminal = take_bool(&mut attrs, id, "terminal")?.unwrap_or(false);
    let claimed_by = take_text(&mut attrs, "claimed_by");
    let rejected_attempts = take_u32(&mut attrs, id, "rejected_attempts")?.unwrap_or(0);
    let updated_at = take_time(&mut attrs, id, "updated_at")?;

    let meta = NodeMetadata {
        ticket: take_text(&mut attrs, "ticket"),
        role: take_text(&mut attrs, "role"),
        acceptance: take_text(&mut attrs, "acceptance"),
        files: take_text(&mut attrs, "files")
            .map(|s| split_files(&s))
            .unwrap_or_default(),
        gate_type: take_text(&mut attrs, "gate_type"),
        extra: attrs,
    };

    Ok(PipelineNode {
        id: id.to_string(),
        kind,
        handler,
        status,
        retries,
        max_retries,
        terminal,
        claimed_by,
        rejected_attempts,
        updated_at,
        meta,
    })
}

fn edge_from_def(def: &EdgeDef) -> Result<PipelineEdge> {
    let owner = format!("{} -> {}", def.from, def.to);
    let mut attrs = def.attrs.clone();
    Ok(PipelineEdge {
        from: def.from.clone(),
        to: def.to.clone(),
        label: take_text(&mut attrs, "label"),
        cycle_override: take_bool(&mut attrs, &owner, "cycle_override")?.unwrap_or(false),
        extra: attrs,
    })
}

fn meta_from_attrs(graph_name: &str, attrs: &Attrs) -> Result<GraphMeta> {
    let mut attrs = attrs.clone();
    Ok(GraphMeta {
        ticket: take_text(&mut attrs, "ticket"),
        workspace: take_text(&mut attrs, "workspace"),
        session: take_text(&mut attrs, "session"),
        paused: take_bool(&mut attrs, graph_name, "paused")?.unwrap_or(false),
        revision: take_u64(&mut attrs, graph_name, "revision")?.unwrap_or(0),
        checkpoint_seq: take_u64(&mut attrs, graph_name, "checkpoint_seq")?,
        checkpoint_at: take_time(&mut attrs, graph_name, "checkpoint_at")?,
        extra: attrs,
    })
}

fn put_text(attrs: &mut Attrs, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        attrs.insert(key.to_string(), AttributeValue::String(v.clone()));
    }
}

impl PipelineGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta: GraphMeta::default(),
            nodes: IndexMap::new(),
            edges: Vec::new(),
        }
    }

    /// Lift a parsed graph file into typed nodes and edges.
    ///
    /// Attribute types are checked here. Structural rules are checked by
    /// [`crate::validation::validate`].
    pub fn from_dot(graph: &DotGraph) -> Result<Self> {
        let meta = meta_from_attrs(&graph.name, &graph.attrs)?;
        let mut nodes = IndexMap::with_capacity(graph.nodes.len());
        for (id, def) in &graph.nodes {
            nodes.insert(id.clone(), node_from_def(def)?);
        }
        let edges = graph
            .edges
            .iter()
            .map(edge_from_def)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: graph.name.clone(),
            meta,
            nodes,
            edges,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::from_dot(&warden_dot::parse(text)?)
    }

    /// Lower back into the file representation. Attribute order is fixed so the
    /// output is deterministic.
    pub fn to_dot(&self) -> DotGraph {
        let mut dot = DotGraph::new(self.name.clone());

        let m = &self.meta;
        put_text(&mut dot.attrs, "ticket", &m.ticket);
        put_text(&mut dot.attrs, "workspace", &m.workspace);
        put_text(&mut dot.attrs, "session", &m.session);
        if m.paused {
            dot.attrs.insert("paused".into(), true.into());
        }
        dot.attrs.insert("revision".into(), (m.revision as i64).into());
        if let Some(seq) = m.checkpoint_seq {
            dot.attrs.insert("checkpoint_seq".into(), (seq as i64).into());
        }
        if let Some(at) = m.checkpoint_at {
            dot.attrs.insert("checkpoint_at".into(), format_time(at).into());
        }
        dot.attrs.extend(m.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        for node in self.nodes.values() {
            let mut attrs = Attrs::new();
            attrs.insert("shape".into(), node.kind.shape().into());
            put_text(&mut attrs, "handler", &node.handler);
            attrs.insert("status".into(), node.status.as_str().into());
            attrs.insert("retries".into(), i64::from(node.retries).into());
            if let Some(max) = node.max_retries {
                attrs.insert("max_retries".into(), i64::from(max).into());
            }
            if node.terminal {
                attrs.insert("terminal".into(), true.into());
            }
            put_text(&mut attrs, "claimed_by", &node.claimed_by);
            if node.rejected_attempts > 0 {
                attrs.insert(
                    "rejected_attempts".into(),
                    i64::from(node.rejected_attempts).into(),
                );
            }
            if let Some(at) = node.updated_at {
                attrs.insert("updated_at".into(), format_time(at).into());
            }
            put_text(&mut attrs, "ticket", &node.meta.ticket);
            put_text(&mut attrs, "role", &node.meta.role);
            put_text(&mut attrs, "acceptance", &node.meta.acceptance);
            if !node.meta.files.is_empty() {
                attrs.insert("files".into(), node.meta.files.join(",").into());
            }
            put_text(&mut attrs, "gate_type", &node.meta.gate_type);
            attrs.extend(node.meta.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

            dot.nodes.insert(
                node.id.clone(),
                NodeDef {
                    id: node.id.clone(),
                    attrs,
                },
            );
        }

        for edge in &self.edges {
            let mut attrs = Attrs::new();
            put_text(&mut attrs, "label", &edge.label);
            if edge.cycle_override {
                attrs.insert("cycle_override".into(), true.into());
            }
            attrs.extend(edge.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            dot.edges.push(EdgeDef {
                from: edge.from.clone(),
                to: edge.to.clone(),
                attrs,
            });
        }

        dot
    }

    pub fn to_dot_string(&self) -> String {
        warden_dot::write(&self.to_dot())
    }

    // --- Read access ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &GraphMeta {
        &self.meta
    }

    pub fn session(&self) -> Option<&str> {
        self.meta.session.as_deref()
    }

    pub fn is_paused(&self) -> bool {
        self.meta.paused
    }

    pub fn revision(&self) -> u64 {
        self.meta.revision
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[PipelineEdge] {
        &self.edges
    }

    pub fn find_edge(&self, from: &str, to: &str) -> Option<&PipelineEdge> {
        self.edges.iter().find(|e| e.from == from && e.to == to)
    }

    pub fn outgoing_edges(&self, id: &str) -> Vec<&PipelineEdge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    pub fn incoming_edges(&self, id: &str) -> Vec<&PipelineEdge> {
        self.edges.iter().filter(|e| e.to == id).collect()
    }

    /// Number of edges touching `id` in either direction.
    pub fn degree(&self, id: &str) -> usize {
        self.edges
            .iter()
            .filter(|e| e.from == id || e.to == id)
            .count()
    }

    /// Dependencies of `id`: sources of its incoming edges, except cycle overrides.
    pub fn upstream(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id && !e.cycle_override)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.nodes.values().find(|n| n.kind == NodeKind::Start)
    }

    pub fn exit_node(&self) -> Option<&PipelineNode> {
        self.nodes.values().find(|n| n.kind == NodeKind::Exit)
    }

    /// Every dependency of a `pending` node is `validated`.
    pub fn deps_met(&self, id: &str) -> bool {
        self.upstream(id).into_iter().all(|up| {
            self.nodes
                .get(up)
                .is_some_and(|n| n.status == NodeStatus::Validated)
        })
    }

    /// Pending nodes whose dependencies are all validated, in insertion order.
    ///
    /// Administrative pause is not considered here; callers that dispatch
    /// check [`Self::is_paused`] themselves.
    pub fn dispatchable(&self) -> Vec<&PipelineNode> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Pending && self.deps_met(&n.id))
            .collect()
    }

    pub fn status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }

    /// Shortest path `from ->* to` following edges, optionally skipping overridden ones.
    pub fn find_path(&self, from: &str, to: &str, skip_overridden: bool) -> Option<Vec<String>> {
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to.to_string()];
                let mut at = to;
                while let Some(&p) = prev.get(at) {
                    path.push(p.to_string());
                    at = p;
                }
                path.reverse();
                return Some(path);
            }
            for edge in self.edges.iter().filter(|e| e.from == current) {
                if skip_overridden && edge.cycle_override {
                    continue;
                }
                if seen.insert(edge.to.as_str()) {
                    prev.insert(edge.to.as_str(), current);
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        None
    }

    /// One cycle in the graph as a closed node path, if any exists.
    pub fn find_cycle(&self, skip_overridden: bool) -> Option<Vec<String>> {
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            if skip_overridden && edge.cycle_override {
                continue;
            }
            successors
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        let mut on_path: HashSet<&str> = HashSet::new();
        let mut done: HashSet<&str> = HashSet::new();

        for root in self.nodes.keys() {
            let root = root.as_str();
            if done.contains(root) {
                continue;
            }
            // (node, index of its next successor to explore)
            let mut path: Vec<(&str, usize)> = vec![(root, 0)];
            on_path.insert(root);

            while let Some(frame) = path.last_mut() {
                let (id, cursor) = *frame;
                let Some(&next) = successors.get(id).and_then(|s| s.get(cursor)) else {
                    on_path.remove(id);
                    done.insert(id);
                    path.pop();
                    continue;
                };
                frame.1 += 1;

                if on_path.contains(next) {
                    let start = path.iter().position(|(n, _)| *n == next)?;
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|(n, _)| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                // Dangling endpoints are reported by validation, not here.
                if !done.contains(next) && self.nodes.contains_key(next) {
                    on_path.insert(next);
                    path.push((next, 0));
                }
            }
        }
        None
    }

    // --- Crate-internal mutation, used by edit operations and the scheduler ---

    pub(crate) fn meta_mut(&mut self) -> &mut GraphMeta {
        &mut self.meta
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut PipelineNode> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn insert_node(&mut self, node: PipelineNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub(crate) fn take_node(&mut self, id: &str) -> Option<PipelineNode> {
        self.nodes.shift_remove(id)
    }

    pub(crate) fn push_edge(&mut self, edge: PipelineEdge) {
        self.edges.push(edge);
    }

    pub(crate) fn retain_edges(&mut self, keep: impl FnMut(&PipelineEdge) -> bool) {
        self.edges.retain(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> PipelineGraph {
        PipelineGraph::parse(src).unwrap()
    }

    #[test]
    fn typed_fields_are_lifted() {
        let g = parse(
            r#"digraph p {
                graph [ticket="T-1", workspace="/w", session="s1", revision=4]
                build [shape=box, handler="codegen", status=active, retries=1, max_retries=5,
                       claimed_by="w1", role="implementer", files="a.rs, b.rs", label="Build"]
                check [shape=hexagon, gate_type="tests"]
                build -> check [label="verify"]
            }"#,
        );

        assert_eq!(g.meta().ticket.as_deref(), Some("T-1"));
        assert_eq!(g.session(), Some("s1"));
        assert_eq!(g.revision(), 4);

        let build = g.node("build").unwrap();
        assert_eq!(build.kind, NodeKind::Task);
        assert_eq!(build.status, NodeStatus::Active);
        assert_eq!(build.retries, 1);
        assert_eq!(build.max_retries, Some(5));
        assert_eq!(build.claimed_by.as_deref(), Some("w1"));
        assert_eq!(build.meta.files, vec!["a.rs", "b.rs"]);
        assert_eq!(
            build.meta.extra.get("label"),
            Some(&AttributeValue::String("Build".into()))
        );

        let check = g.node("check").unwrap();
        assert_eq!(check.kind, NodeKind::Gate);
        assert_eq!(check.status, NodeStatus::Pending);
        assert_eq!(check.meta.gate_type.as_deref(), Some("tests"));

        assert_eq!(g.edges()[0].label.as_deref(), Some("verify"));
    }

    #[test]
    fn missing_shape_defaults_to_task() {
        let g = parse("digraph p { a; a -> b }");
        assert_eq!(g.node("a").unwrap().kind, NodeKind::Task);
        assert_eq!(g.node("b").unwrap().kind, NodeKind::Task);
    }

    #[test]
    fn explicit_kind_is_accepted() {
        let g = parse("digraph p { s [kind=start] }");
        assert_eq!(g.node("s").unwrap().kind, NodeKind::Start);
    }

    #[test]
    fn unknown_shape_is_rejected() {
        let err = PipelineGraph::parse("digraph p { a [shape=ellipse] }").unwrap_err();
        assert!(
            matches!(err, WardenError::InvalidAttribute { ref key, .. } if key == "shape"),
            "{err:?}"
        );
    }

    #[test]
    fn contradicting_kind_and_shape_is_rejected() {
        let err = PipelineGraph::parse("digraph p { a [kind=gate, shape=box] }").unwrap_err();
        assert!(matches!(err, WardenError::InvalidAttribute { .. }));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = PipelineGraph::parse("digraph p { a [status=done] }").unwrap_err();
        assert!(
            matches!(err, WardenError::InvalidAttribute { ref owner, ref key, .. } if owner == "a" && key == "status")
        );
    }

    #[test]
    fn negative_retries_are_rejected() {
        assert!(PipelineGraph::parse("digraph p { a [retries=-1] }").is_err());
    }

    #[test]
    fn rewrite_is_lossless() {
        let g = parse(
            r#"digraph p {
                graph [ticket="T-9", paused=true, checkpoint_seq=3, checkpoint_at="2026-03-01T10:00:00.000000Z", owner="ops"]
                a [shape=Mdiamond]
                b [handler="codegen", status=failed, retries=2, terminal=true, rejected_attempts=1,
                   updated_at="2026-03-01T09:00:00.000000Z", acceptance="tests pass", weight=2.5]
                c [shape=Msquare]
                a -> b -> c
                c -> b [cycle_override=true]
            }"#,
        );
        let text = g.to_dot_string();
        let again = PipelineGraph::parse(&text).unwrap();
        assert_eq!(again, g);
        assert_eq!(again.to_dot_string(), text);
    }

    #[test]
    fn dispatchable_follows_insertion_order() {
        let g = parse("digraph p { z; a; m; a -> m }");
        let ids: Vec<_> = g.dispatchable().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn dispatchable_requires_validated_upstream() {
        let g = parse(
            "digraph p { a [status=validated]; b [status=impl_complete]; c; d; a -> c; b -> d }",
        );
        let ids: Vec<_> = g.dispatchable().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn overridden_edges_do_not_gate_dispatch() {
        let g = parse("digraph p { a; b; a -> b; b -> a [cycle_override=true] }");
        let ids: Vec<_> = g.dispatchable().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn find_cycle_reports_closed_path() {
        let g = parse("digraph p { a -> b -> c -> a; x -> a }");
        let cycle = g.find_cycle(false).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn find_cycle_can_skip_overrides() {
        let g = parse("digraph p { a -> b; b -> a [cycle_override=true] }");
        assert!(g.find_cycle(false).is_some());
        assert!(g.find_cycle(true).is_none());
    }

    #[test]
    fn find_cycle_handles_long_chains() {
        let mut g = PipelineGraph::new("chain");
        let len = 200_000;
        for i in 0..len {
            g.insert_node(PipelineNode::new(format!("n{i}"), NodeKind::Task));
            if i > 0 {
                g.push_edge(PipelineEdge::new(format!("n{}", i - 1), format!("n{i}")));
            }
        }
        assert!(g.find_cycle(false).is_none());

        g.push_edge(PipelineEdge::new(format!("n{}", len - 1), "n0"));
        let cycle = g.find_cycle(false).unwrap();
        assert_eq!(cycle.len(), len + 1);
        assert_eq!(cycle.first().map(String::as_str), Some("n0"));
    }

    #[test]
    fn find_path_returns_shortest() {
        let g = parse("digraph p { a -> b -> c -> d; a -> d }");
        assert_eq!(g.find_path("a", "d", false).unwrap(), vec!["a", "d"]);
        assert!(g.find_path("d", "a", false).is_none());
    }

    #[test]
    fn start_and_exit_lookup() {
        let g = parse("digraph p { s [shape=Mdiamond]; t; e [shape=Msquare]; s -> t -> e }");
        assert_eq!(g.start_node().unwrap().id, "s");
        assert_eq!(g.exit_node().unwrap().id, "e");
        assert_eq!(g.upstream("t"), vec!["s"]);
        assert_eq!(g.degree("t"), 2);
    }
}
