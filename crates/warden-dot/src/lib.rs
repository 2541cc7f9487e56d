//! Reader and writer for warden's graph file, a strict Graphviz subset.
//!
//! Parses `digraph Name { ... }` with nodes, chained edges, default blocks and
//! typed attributes into a [`DotGraph`] whose nodes and attributes keep file
//! order. [`write`] renders a graph back deterministically, which is how every
//! status change is reflected into the same artifact a human edits.
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start -> build -> done }"#;
//! let graph = warden_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! assert_eq!(warden_dot::parse(&warden_dot::write(&graph)).unwrap(), graph);
//! ```

pub mod ast;
mod parser;
mod writer;

pub use ast::*;
pub use parser::parse;
pub use writer::write;
