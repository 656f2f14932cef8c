//! Graph rewriting: rule and driver abstractions plus the standard BLAS
//! specialization pipeline.
//!
//! A [`NodeRewriter`] inspects one apply and proposes replacement
//! expressions; it never mutates the graph. Drivers ([`GraphRewriter`]
//! implementations) import candidates, commit them through the graph's
//! validating replacement API, and decide what to visit next. The
//! [`RewriteDatabase`] orders drivers into a pipeline; [`blas_pipeline`]
//! builds the standard one.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::graph::builder::Expr;
use crate::graph::{
    Graph, GraphListener, ImportError, InconsistencyError, ListenerId, Node, NodeId, ReplaceError,
};

pub mod diagnostics;
mod gemm;
mod inplace;


pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use gemm::{DotToDot22, GemmRewriter, GemmToGemv, GemmToGer};
pub use inplace::{InplaceBlas, InplacePass};

/// Errors from running a rewrite driver.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizeError {
    /// A rule replaced more nodes than the driver's use ratio allows,
    /// suggesting it is cycling.
    RuleOveruse { rule: String },
    /// The graph was invalid before any rewriting took place.
    Graph(InconsistencyError),
    /// A rule produced a candidate that cannot be imported. This is a bug in
    /// the rule, not a recoverable rejection.
    BadCandidate { rule: String, error: ImportError },
}

impl Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizeError::RuleOveruse { rule } => {
                write!(f, "rule \"{}\" exceeded its use limit", rule)
            }
            OptimizeError::Graph(err) => write!(f, "{}", err),
            OptimizeError::BadCandidate { rule, error } => {
                write!(f, "rule \"{}\" produced a bad candidate: {}", rule, error)
            }
        }
    }
}

impl Error for OptimizeError {}

impl From<InconsistencyError> for OptimizeError {
    fn from(err: InconsistencyError) -> OptimizeError {
        OptimizeError::Graph(err)
    }
}

/// Result of asking a [`NodeRewriter`] about one apply.
pub enum RewriteOutcome {
    /// The rule does not apply here.
    NoMatch,
    /// Replace the apply's outputs with these expressions, one per output.
    Replace(Vec<Expr>),
}

/// A local rewrite rule.
///
/// Rules are pure pattern matchers: they look at an apply and either decline
/// or return detached replacement expressions. Importing and committing the
/// replacement, including handling validation failures, is the driver's job.
pub trait NodeRewriter {
    fn name(&self) -> &str;

    fn rewrite(&self, graph: &Graph, apply: NodeId) -> RewriteOutcome;
}

/// Counters describing what a driver did to a graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewriteStats {
    /// Committed replacements.
    pub replacements: usize,
    /// Candidates rolled back because validation failed.
    pub rejected_inconsistent: usize,
    /// Candidates rolled back because a required node stayed reachable.
    pub rejected_did_not_remove: usize,
    /// Full passes over the graph.
    pub passes: usize,
}

impl RewriteStats {
    pub fn merge(&mut self, other: &RewriteStats) {
        self.replacements += other.replacements;
        self.rejected_inconsistent += other.rejected_inconsistent;
        self.rejected_did_not_remove += other.rejected_did_not_remove;
        self.passes += other.passes;
    }
}

/// A whole-graph rewrite driver.
pub trait GraphRewriter {
    fn name(&self) -> &str;

    fn apply(&self, graph: &mut Graph, diag: &Diagnostics) -> Result<RewriteStats, OptimizeError>;
}

/// Listener that records applies imported into a graph, so drivers can
/// extend their worklists with nodes created by committed rewrites.
#[derive(Default)]
pub(crate) struct ImportTracker {
    imported: Vec<NodeId>,
}

impl ImportTracker {
    pub fn take_imported(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.imported)
    }
}

impl GraphListener for ImportTracker {
    fn on_import(&mut self, _graph: &Graph, apply: NodeId) {
        self.imported.push(apply);
    }
}

pub(crate) fn is_live_apply(graph: &Graph, id: NodeId) -> bool {
    matches!(graph.node(id), Some(Node::Apply(_)))
}

/// Run one rule against one apply, committing its replacement if it matches
/// and validates.
///
/// Returns the IDs of the replacement variables on success, `None` if the
/// rule declined or its candidate was rejected (rejections are counted in
/// `stats` and leave the graph unchanged).
pub(crate) fn apply_rule(
    graph: &mut Graph,
    rule: &dyn NodeRewriter,
    apply: NodeId,
    diag: &Diagnostics,
    stats: &mut RewriteStats,
) -> Result<Option<Vec<NodeId>>, OptimizeError> {
    let exprs = match rule.rewrite(graph, apply) {
        RewriteOutcome::NoMatch => return Ok(None),
        RewriteOutcome::Replace(exprs) => exprs,
    };
    let outputs = graph.apply_outputs(apply).to_vec();
    debug_assert_eq!(exprs.len(), outputs.len());

    let mut new_ids = Vec::with_capacity(exprs.len());
    for expr in &exprs {
        match graph.import_expr(expr) {
            Ok(id) => new_ids.push(id),
            Err(err @ ImportError::Type(_)) => {
                return Err(OptimizeError::BadCandidate {
                    rule: rule.name().to_string(),
                    error: err,
                });
            }
            Err(ImportError::Inconsistency(_)) => {
                // eg. a destructive candidate whose operands alias. Drop
                // whatever was imported and move on.
                stats.rejected_inconsistent += 1;
                graph.prune_unreachable();
                return Ok(None);
            }
        }
    }

    let pairs: Vec<(NodeId, NodeId)> = outputs.into_iter().zip(new_ids.iter().copied()).collect();
    match graph.replace_all_validate(&pairs, rule.name()) {
        Ok(()) => {
            stats.replacements += 1;
            diag.info(graph, apply, format_args!("rewritten by {}", rule.name()));
            Ok(Some(new_ids))
        }
        Err(ReplaceError::Inconsistent(_)) => {
            stats.rejected_inconsistent += 1;
            diag.warn(graph, apply, format_args!("{} candidate rejected", rule.name()));
            Ok(None)
        }
        Err(ReplaceError::Type(type_err)) => Err(OptimizeError::BadCandidate {
            rule: rule.name().to_string(),
            error: ImportError::Type(type_err),
        }),
        Err(ReplaceError::DidNotRemove(_)) => {
            stats.rejected_did_not_remove += 1;
            Ok(None)
        }
    }
}

/// Single forward pass over the graph in topological order, applying the
/// first matching rule at each apply and visiting replacement nodes as they
/// appear.
pub struct InOutPass {
    name: String,
    rules: Vec<Box<dyn NodeRewriter>>,
}

impl InOutPass {
    pub fn new(name: &str, rules: Vec<Box<dyn NodeRewriter>>) -> InOutPass {
        InOutPass {
            name: name.to_string(),
            rules,
        }
    }
}

impl GraphRewriter for InOutPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, graph: &mut Graph, diag: &Diagnostics) -> Result<RewriteStats, OptimizeError> {
        let tracker = graph.attach_listener(Box::<ImportTracker>::default());
        let result = self.apply_inner(graph, diag, tracker);
        graph.detach_listener(tracker);
        result
    }
}

impl InOutPass {
    fn apply_inner(
        &self,
        graph: &mut Graph,
        diag: &Diagnostics,
        tracker: ListenerId,
    ) -> Result<RewriteStats, OptimizeError> {
        let mut stats = RewriteStats { passes: 1, ..Default::default() };
        let mut queue: VecDeque<NodeId> = graph.toposort()?.into();
        // Imports from candidate construction; only those surviving a commit
        // matter, and the liveness check skips the rest.
        if let Some(t) = graph.listener_downcast_mut::<ImportTracker>(tracker) {
            t.take_imported();
        }

        while let Some(apply) = queue.pop_front() {
            if !is_live_apply(graph, apply) {
                continue;
            }
            for rule in &self.rules {
                if apply_rule(graph, rule.as_ref(), apply, diag, &mut stats)?.is_some() {
                    if let Some(t) = graph.listener_downcast_mut::<ImportTracker>(tracker) {
                        queue.extend(t.take_imported());
                    }
                    break;
                }
            }
        }
        Ok(stats)
    }
}

/// Repeated full passes over the graph until a pass makes no changes.
///
/// A rule that keeps matching its own output would cycle forever; the
/// `max_use_ratio` guard aborts loudly once a rule's replacement count
/// exceeds `max_use_ratio` times the apply count, leaving the graph in its
/// last valid state.
pub struct EquilibriumPass {
    name: String,
    rules: Vec<Box<dyn NodeRewriter>>,
    max_use_ratio: f32,
}

impl EquilibriumPass {
    pub fn new(name: &str, rules: Vec<Box<dyn NodeRewriter>>, max_use_ratio: f32) -> Self {
        EquilibriumPass {
            name: name.to_string(),
            rules,
            max_use_ratio,
        }
    }
}

impl GraphRewriter for EquilibriumPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, graph: &mut Graph, diag: &Diagnostics) -> Result<RewriteStats, OptimizeError> {
        let mut stats = RewriteStats::default();
        let max_use = ((self.max_use_ratio * graph.apply_count() as f32).ceil() as usize).max(1);
        let mut use_counts = vec![0usize; self.rules.len()];

        loop {
            let before = stats.replacements;
            stats.passes += 1;
            for apply in graph.toposort()? {
                if !is_live_apply(graph, apply) {
                    continue;
                }
                for (index, rule) in self.rules.iter().enumerate() {
                    if apply_rule(graph, rule.as_ref(), apply, diag, &mut stats)?.is_some() {
                        use_counts[index] += 1;
                        if use_counts[index] > max_use {
                            return Err(OptimizeError::RuleOveruse {
                                rule: rule.name().to_string(),
                            });
                        }
                        break;
                    }
                }
            }
            if stats.replacements == before {
                return Ok(stats);
            }
        }
    }
}

struct DatabaseEntry {
    name: String,
    position: f64,
    tags: Vec<String>,
    rewriter: Box<dyn GraphRewriter>,
}

/// An ordered, tagged registry of rewrite drivers.
///
/// Positions are floats so new entries can be registered between existing
/// ones without renumbering.
#[derive(Default)]
pub struct RewriteDatabase {
    entries: Vec<DatabaseEntry>,
}

impl RewriteDatabase {
    pub fn new() -> RewriteDatabase {
        RewriteDatabase::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        rewriter: Box<dyn GraphRewriter>,
        tags: &[&str],
        position: f64,
    ) {
        self.entries.push(DatabaseEntry {
            name: name.to_string(),
            position,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            rewriter,
        });
    }

    /// Select drivers carrying all `include` tags and none of the `exclude`
    /// tags, ordered by position.
    pub fn query(&self, include: &[&str], exclude: &[&str]) -> Vec<&dyn GraphRewriter> {
        let mut selected: Vec<&DatabaseEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                include.iter().all(|tag| entry.tags.iter().any(|t| t == tag))
                    && !exclude.iter().any(|tag| entry.tags.iter().any(|t| t == tag))
            })
            .collect();
        selected.sort_by(|a, b| {
            a.position
                .partial_cmp(&b.position)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        selected.into_iter().map(|entry| entry.rewriter.as_ref()).collect()
    }

    /// Names of the drivers a query selects, in order. Mostly useful in
    /// tests and diagnostics.
    pub fn query_names(&self, include: &[&str], exclude: &[&str]) -> Vec<&str> {
        let rewriters = self.query(include, exclude);
        rewriters.into_iter().map(|r| r.name()).collect()
    }

    /// Run the drivers a query selects, in order, merging their stats.
    pub fn run(
        &self,
        graph: &mut Graph,
        include: &[&str],
        exclude: &[&str],
        diag: &Diagnostics,
    ) -> Result<RewriteStats, OptimizeError> {
        let mut stats = RewriteStats::default();
        for rewriter in self.query(include, exclude) {
            stats.merge(&rewriter.apply(graph, diag)?);
        }
        Ok(stats)
    }
}

/// The standard BLAS specialization pipeline.
///
/// In order: general dot products become `Dot22` applies; sums of scaled
/// matrix products fuse into `Gemm`; degenerate `Gemm`s become `Gemv` or
/// `Ger`; finally (under the `inplace` tag) non-destructive BLAS applies
/// become destructive where that is provably safe.
pub fn blas_pipeline() -> RewriteDatabase {
    let mut db = RewriteDatabase::new();
    db.register(
        "dot_to_dot22",
        Box::new(InOutPass::new("dot_to_dot22", vec![Box::new(DotToDot22 {})])),
        &["fast_run"],
        0.0,
    );
    db.register(
        "gemm_rewriter",
        Box::new(GemmRewriter::new()),
        &["fast_run"],
        10.0,
    );
    db.register(
        "gemm_to_gemv_or_ger",
        Box::new(EquilibriumPass::new(
            "gemm_to_gemv_or_ger",
            vec![Box::new(GemmToGemv {}), Box::new(GemmToGer {})],
            5.0,
        )),
        &["fast_run"],
        15.0,
    );
    db.register(
        "inplace_blas",
        Box::new(InplacePass::new()),
        &["fast_run", "inplace"],
        70.0,
    );
    db
}
