use std::fmt::Write as _;

use crate::ast::*;

const KEYWORDS: [&str; 6] = ["digraph", "graph", "node", "edge", "subgraph", "strict"];

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_bare_key(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn render_id(id: &str) -> String {
    if is_identifier(id) && !KEYWORDS.contains(&id) {
        id.to_string()
    } else {
        quote(id)
    }
}

fn render_key(key: &str) -> String {
    if is_bare_key(key) && !KEYWORDS.contains(&key) {
        key.to_string()
    } else {
        quote(key)
    }
}

fn render_value(value: &AttributeValue) -> String {
    match value {
        AttributeValue::String(s) => quote(s),
        AttributeValue::Integer(i) => i.to_string(),
        AttributeValue::Boolean(b) => b.to_string(),
        // The reader only accepts `digits.digits`, never exponents or NaN.
        AttributeValue::Float(x) if !x.is_finite() => quote(&x.to_string()),
        AttributeValue::Float(x) if x.fract() == 0.0 => format!("{x:.1}"),
        AttributeValue::Float(x) => x.to_string(),
    }
}

fn render_attrs(attrs: &Attrs) -> String {
    let parts: Vec<String> = attrs
        .iter()
        .map(|(k, v)| format!("{}={}", render_key(k), render_value(v)))
        .collect();
    format!("[{}]", parts.join(", "))
}

/// Render a graph as graph-file text.
///
/// Output is a pure function of the graph: attributes, nodes and edges are
/// emitted in insertion order, so writing the same graph twice yields
/// byte-identical files and `parse(write(g)) == g`.
pub fn write(graph: &DotGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph {} {{", render_id(&graph.name));

    if !graph.attrs.is_empty() {
        let _ = writeln!(out, "    graph {};", render_attrs(&graph.attrs));
    }
    if !graph.nodes.is_empty() {
        out.push('\n');
    }
    for node in graph.nodes.values() {
        if node.attrs.is_empty() {
            let _ = writeln!(out, "    {};", render_id(&node.id));
        } else {
            let _ = writeln!(out, "    {} {};", render_id(&node.id), render_attrs(&node.attrs));
        }
    }
    if !graph.edges.is_empty() {
        out.push('\n');
    }
    for edge in &graph.edges {
        let _ = write!(out, "    {} -> {}", render_id(&edge.from), render_id(&edge.to));
        if !edge.attrs.is_empty() {
            let _ = write!(out, " {}", render_attrs(&edge.attrs));
        }
        out.push_str(";\n");
    }

    out.push_str("}\n");
    out
}
