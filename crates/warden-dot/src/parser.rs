use indexmap::IndexMap;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use warden_types::WardenError;

use crate::ast::*;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Strip `//` line comments and `/* */` block comments, keeping newlines so
/// reported line numbers match the original text.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    if n == '\n' {
                        out.push('\n');
                    }
                    prev = n;
                }
            }
            '"' => {
                // string literal: copied verbatim, escapes included
                out.push('"');
                let mut escaped = false;
                for n in chars.by_ref() {
                    out.push(n);
                    if escaped {
                        escaped = false;
                    } else if n == '\\' {
                        escaped = true;
                    } else if n == '"' {
                        break;
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// identifier ( '.' identifier )*, returned as the full dotted string.
fn qualified_or_plain_id(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut s = first.to_string();
    for part in rest {
        s.push('.');
        s.push_str(part);
    }
    Ok(s)
}

/// Parse a double-quoted string with escape support.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any.parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Node ids and the graph name: bare identifier or quoted string.
fn node_id(input: &mut &str) -> ModalResult<String> {
    alt((quoted_string, identifier.map(str::to_string))).parse_next(input)
}

fn attr_key(input: &mut &str) -> ModalResult<String> {
    alt((quoted_string, qualified_or_plain_id)).parse_next(input)
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    alt((literal("true").value(true), literal("false").value(false))).parse_next(input)
}

/// Optional sign, digits, '.', digits.
fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn attr_value(input: &mut &str) -> ModalResult<AttributeValue> {
    alt((
        quoted_string.map(AttributeValue::String),
        boolean_value.map(AttributeValue::Boolean),
        float_value.map(AttributeValue::Float),
        integer_value.map(AttributeValue::Integer),
    ))
    .parse_next(input)
}

/// key '=' value
fn attr(input: &mut &str) -> ModalResult<(String, AttributeValue)> {
    let key = attr_key.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// '[' attr ( (','|';')? attr )* ']'
fn attr_block(input: &mut &str) -> ModalResult<Attrs> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = Attrs::new();
    while let Some((k, v)) = opt(attr).parse_next(input)? {
        attrs.insert(k, v);
        let _ = ws.parse_next(input)?;
        let _ = opt(alt((',', ';'))).parse_next(input)?;
        let _ = ws.parse_next(input)?;
    }

    let _ = ws.parse_next(input)?;
    let _ = ']'.parse_next(input)?;
    Ok(attrs)
}

/// A parsed statement, before merging into a [`DotGraph`].
enum Statement {
    GraphAttrs(Attrs),
    NodeDefaults(Attrs),
    EdgeDefaults(Attrs),
    Node(String, Attrs),
    Edge(Vec<String>, Attrs),
    GraphAttrDecl(String, AttributeValue),
}

/// `<keyword> [ ... ] ;?` for the three default/attribute blocks.
fn keyword_block<'i>(
    keyword: &'static str,
) -> impl FnMut(&mut &'i str) -> ModalResult<Attrs> {
    move |input: &mut &'i str| {
        let _ = literal(keyword).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let attrs = attr_block.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        Ok(attrs)
    }
}

fn edge_target(input: &mut &str) -> ModalResult<String> {
    node_id
        .context(StrContext::Expected(StrContextValue::Description(
            "edge target node id",
        )))
        .parse_next(input)
}

/// A node or edge statement, or a bare `key = value` graph attribute.
fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Statement> {
    let first = node_id.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first];
        let _ = ws.parse_next(input)?;
        chain.push(edge_target.parse_next(input)?);
        loop {
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
            let _ = ws.parse_next(input)?;
            chain.push(edge_target.parse_next(input)?);
        }

        let _ = ws.parse_next(input)?;
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(make_cut_error(
            "only directed edges (->); undirected edges (--) are not supported",
        ));
    }

    if let Some(attrs) = opt(attr_block).parse_next(input)? {
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first, attrs));
    }

    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first, val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first, Attrs::new()))
}

fn statement(input: &mut &str) -> ModalResult<Statement> {
    let _ = ws.parse_next(input)?;
    if let Some(rest) = input.strip_prefix("subgraph") {
        if rest.starts_with(|c: char| c.is_whitespace() || c == '{') {
            return Err(make_cut_error(
                "node, edge or attribute statement (subgraphs are not supported)",
            ));
        }
    }
    alt((
        keyword_block("graph").map(Statement::GraphAttrs),
        keyword_block("node").map(Statement::NodeDefaults),
        keyword_block("edge").map(Statement::EdgeDefaults),
        node_or_edge_stmt,
    ))
    .parse_next(input)
}

fn statements(input: &mut &str) -> ModalResult<Vec<Statement>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

fn ensure_node<'a>(
    nodes: &'a mut IndexMap<String, NodeDef>,
    id: &str,
    defaults: &Attrs,
) -> &'a mut NodeDef {
    nodes.entry(id.to_string()).or_insert_with(|| NodeDef {
        id: id.to_string(),
        attrs: defaults.clone(),
    })
}

/// Fold statements into a graph. Nodes appear in first-mention order; a node
/// mentioned twice gets the union of its attribute blocks, later keys winning.
fn build_graph(name: String, stmts: Vec<Statement>) -> DotGraph {
    let mut graph = DotGraph::new(name);
    let mut node_defaults = Attrs::new();
    let mut edge_defaults = Attrs::new();

    for stmt in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => graph.attrs.extend(attrs),
            Statement::NodeDefaults(attrs) => node_defaults.extend(attrs),
            Statement::EdgeDefaults(attrs) => edge_defaults.extend(attrs),
            Statement::Node(id, attrs) => {
                ensure_node(&mut graph.nodes, &id, &node_defaults)
                    .attrs
                    .extend(attrs);
            }
            Statement::Edge(chain, attrs) => {
                for id in &chain {
                    ensure_node(&mut graph.nodes, id, &node_defaults);
                }
                // A -> B -> C expands to (A,B), (B,C) sharing the same attrs
                for pair in chain.windows(2) {
                    let mut merged = edge_defaults.clone();
                    merged.extend(attrs.clone());
                    graph.edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                    });
                }
            }
            Statement::GraphAttrDecl(key, val) => {
                graph.attrs.insert(key, val);
            }
        }
    }
    graph
}

/// 'digraph' id '{' statements '}'
fn parse_digraph(input: &mut &str) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(make_cut_error(
            "'digraph' keyword (strict graphs are not supported)",
        ));
    }
    if let Some(after) = input.strip_prefix("graph") {
        let trimmed = after.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(make_cut_error(
                "'digraph' keyword (undirected graphs are not supported)",
            ));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = node_id
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    if !input.is_empty() {
        return Err(make_cut_error("end of input after closing '}'"));
    }

    Ok(build_graph(name, stmts))
}

/// (line, col), both 1-based, of the first unconsumed byte.
fn offset_to_line_col(text: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = text.len().saturating_sub(remaining_len);
    let prefix = &text[..consumed];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => prefix[pos + 1..].chars().count() + 1,
        None => prefix.chars().count() + 1,
    };
    (line, col)
}

/// Parse graph-file text into a [`DotGraph`].
pub fn parse(input: &str) -> warden_types::Result<DotGraph> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();

    let graph = parse_digraph.parse_next(&mut remaining).map_err(|e| {
        let (line, col) = offset_to_line_col(&stripped, remaining.len());
        let snippet: String = remaining.chars().take(40).collect();
        WardenError::ParseError {
            line,
            col,
            message: format!("{e}"),
            source_snippet: (!snippet.is_empty()).then_some(snippet),
        }
    })?;

    tracing::debug!(
        graph = %graph.name,
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "parsed graph file"
    );
    Ok(graph)
}
