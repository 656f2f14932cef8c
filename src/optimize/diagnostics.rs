use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::env::env_str;
use crate::graph::{Graph, NodeId};

#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    Off,
    /// Report only rejected or aborted rewrites.
    Warn,
    /// Report all rewrites.
    Info,
}

/// Diagnostic reporter for graph rewrites.
pub struct Diagnostics {
    /// Nodes against which diagnostics have been reported at the `Warn` level
    /// or higher.
    warned_nodes: RefCell<FxHashSet<NodeId>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            warned_nodes: RefCell::new(FxHashSet::default()),
            level: DiagnosticLevel::Off,
        }
    }

    /// Create a reporter with the level taken from the `SYMGRAPH_OPT_DIAG`
    /// environment variable ("warn" or "info").
    pub fn from_env() -> Self {
        let mut diag = Self::new();
        match env_str("SYMGRAPH_OPT_DIAG").as_deref() {
            Some("warn") => diag.set_level(DiagnosticLevel::Warn),
            Some("info") => diag.set_level(DiagnosticLevel::Info),
            _ => {}
        }
        diag
    }

    /// Enable reporting of all messages at or above a given level.
    pub fn set_level(&mut self, level: DiagnosticLevel) {
        self.level = level;
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a diagnostic message for a given node at the [`Info`](DiagnosticLevel::Info) level.
    pub fn info(&self, graph: &Graph, node: NodeId, message: std::fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Info {
            return;
        }
        self.log(DiagnosticLevel::Info, graph, node, message);
    }

    /// Log a diagnostic message for a given node at the [`Warn`](DiagnosticLevel::Warn) level.
    ///
    /// Each node is warned about at most once, so drivers that revisit a
    /// node on every pass don't repeat themselves.
    pub fn warn(&self, graph: &Graph, node: NodeId, message: std::fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Warn || self.warned_nodes.borrow().contains(&node) {
            return;
        }
        self.warned_nodes.borrow_mut().insert(node);
        self.log(DiagnosticLevel::Warn, graph, node, message);
    }

    fn log(
        &self,
        level: DiagnosticLevel,
        graph: &Graph,
        node: NodeId,
        message: std::fmt::Arguments<'_>,
    ) {
        let level_char = match level {
            DiagnosticLevel::Warn => 'W',
            DiagnosticLevel::Info => 'I',
            DiagnosticLevel::Off => unreachable!(),
        };
        println!(
            "{}| {}: {}",
            level_char,
            self.node_name(graph, node),
            message
        );
    }

    fn node_name<'a>(&self, g: &'a Graph, id: NodeId) -> &'a str {
        g.node(id).and_then(|n| n.name()).unwrap_or_default()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
