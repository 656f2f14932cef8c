//! Recognition of `beta * Z + alpha * (X @ Y)` patterns.
//!
//! The entry point is [`GemmRewriter`], which decomposes sums of scaled
//! matrices into a flat term list, folds duplicate terms, and looks for a
//! pair of terms that can be expressed as a single `Gemm` apply. The
//! companion [`NodeRewriter`]s handle the surrounding specializations:
//! general dot products into `Dot22` beforehand, degenerate `Gemm`s into
//! `Gemv`/`Ger` afterwards.

use crate::graph::builder::Expr;
use crate::graph::{Graph, ImportError, NodeId, ReplaceError};
use crate::ops::ShuffleDim::{Axis, NewAxis};
use crate::ops::{Op, ShuffleDim};
use crate::optimize::{
    is_live_apply, Diagnostics, GraphRewriter, ImportTracker, NodeRewriter, OptimizeError,
    RewriteOutcome, RewriteStats,
};
use crate::value::{DType, Value};

/// The value of `id` if it is a single-element constant.
fn constant_scalar(graph: &Graph, id: NodeId) -> Option<f64> {
    graph
        .node(id)
        .and_then(|node| node.as_constant())
        .and_then(|constant| constant.value().as_scalar())
}

/// A scalar coefficient: a constant factor times a product of
/// scalar-shaped variables.
#[derive(Clone, Debug)]
struct Scale {
    constant: f64,
    syms: Vec<NodeId>,
}

impl Scale {
    fn one() -> Scale {
        Scale {
            constant: 1.0,
            syms: Vec::new(),
        }
    }

    fn negated(&self) -> Scale {
        Scale {
            constant: -self.constant,
            syms: self.syms.clone(),
        }
    }

    /// Fold another scale into this one if their symbolic parts agree, so
    /// that `3*M - M` becomes `2*M`.
    fn try_add(&self, other: &Scale) -> Option<Scale> {
        let mut a = self.syms.clone();
        let mut b = other.syms.clone();
        a.sort_unstable();
        b.sort_unstable();
        if a == b {
            Some(Scale {
                constant: self.constant + other.constant,
                syms: self.syms.clone(),
            })
        } else {
            None
        }
    }

    /// Whether this scale is exactly the constant `c` with no symbolic part.
    fn is_const(&self, c: f64) -> bool {
        self.syms.is_empty() && self.constant == c
    }

    /// Build a rank-0 expression computing this scale.
    fn to_expr(&self, graph: &Graph, dtype: DType) -> Expr {
        let mut product: Option<Expr> = None;
        for &sym in &self.syms {
            let atom = scalar_shaped_to_rank0(graph, sym);
            product = Some(match product {
                Some(expr) => expr * atom,
                None => atom,
            });
        }
        match product {
            None => Expr::constant(Value::scalar(dtype, self.constant)),
            Some(expr) if self.constant == 1.0 => expr,
            Some(expr) if self.constant == -1.0 => -expr,
            Some(expr) => Expr::constant(Value::scalar(dtype, self.constant)) * expr,
        }
    }
}

/// Wrap a scalar-shaped variable in the dimshuffle that reduces it to
/// rank 0, if it is not rank 0 already.
fn scalar_shaped_to_rank0(graph: &Graph, id: NodeId) -> Expr {
    match graph.value_type(id) {
        Some(ty) if ty.rank() > 0 => Expr::node(id).dimshuffle(&[]),
        _ => Expr::node(id),
    }
}

/// A scalar atom found inside a `Mul`: either a constant to fold, or a
/// scalar-shaped variable to carry symbolically.
enum ScalarAtom {
    Const(f64),
    Sym(NodeId),
}

/// View a scalar-shaped variable as a scalar atom, looking through
/// dimshuffles.
fn as_scalar_atom(graph: &Graph, id: NodeId) -> Option<ScalarAtom> {
    let mut id = id;
    while let Some((producer, _)) = graph.producer(id) {
        let apply = graph.apply_node(producer);
        if matches!(apply.op, Op::DimShuffle { .. }) {
            id = apply.inputs[0];
        } else {
            break;
        }
    }
    if let Some(value) = constant_scalar(graph, id) {
        return Some(ScalarAtom::Const(value));
    }
    match graph.value_type(id) {
        Some(ty) if ty.is_scalar_shaped() => Some(ScalarAtom::Sym(id)),
        _ => None,
    }
}

/// One term of a decomposed sum: `scale * node`.
struct Term {
    scale: Scale,
    node: NodeId,
}

/// Decompose `scale * r` into a flat list of scaled matrix terms, recursing
/// through `Add`, `Sub`, `Neg` and scalar `Mul` applies.
///
/// `maxclients` makes shared subexpressions opaque: a variable with more
/// consumers than the limit becomes a single term rather than being pulled
/// apart, since its apply could not be removed anyway. The root call passes
/// `None`; recursive calls limit to one consumer.
fn canonicalize_terms(
    graph: &Graph,
    r: NodeId,
    scale: Scale,
    out: &mut Vec<Term>,
    maxclients: Option<usize>,
) {
    if let Some(max) = maxclients {
        if graph.clients(r).len() > max {
            out.push(Term { scale, node: r });
            return;
        }
    }
    let Some((producer, _)) = graph.producer(r) else {
        out.push(Term { scale, node: r });
        return;
    };
    let apply = graph.apply_node(producer);
    match &apply.op {
        Op::Sub => {
            canonicalize_terms(graph, apply.inputs[0], scale.clone(), out, Some(1));
            canonicalize_terms(graph, apply.inputs[1], scale.negated(), out, Some(1));
        }
        Op::Add => {
            for &input in &apply.inputs {
                canonicalize_terms(graph, input, scale.clone(), out, Some(1));
            }
        }
        Op::Neg => {
            canonicalize_terms(graph, apply.inputs[0], scale.negated(), out, Some(1));
        }
        Op::Mul => {
            let mut inner_scale = scale.clone();
            let mut tensors = Vec::new();
            for &input in &apply.inputs {
                let Some(ty) = graph.value_type(input) else {
                    out.push(Term { scale, node: r });
                    return;
                };
                if ty.is_scalar_shaped() {
                    match as_scalar_atom(graph, input) {
                        Some(ScalarAtom::Const(value)) => inner_scale.constant *= value,
                        Some(ScalarAtom::Sym(id)) => inner_scale.syms.push(id),
                        None => {
                            out.push(Term { scale, node: r });
                            return;
                        }
                    }
                } else {
                    tensors.push(input);
                }
            }
            if tensors.len() == 1 {
                canonicalize_terms(graph, tensors[0], inner_scale, out, Some(1));
            } else {
                out.push(Term { scale, node: r });
            }
        }
        _ => out.push(Term { scale, node: r }),
    }
}

/// Merge terms over the same variable by adding their scales.
fn factor_terms(terms: Vec<Term>) -> Vec<Term> {
    let mut out: Vec<Term> = Vec::new();
    for term in terms {
        let merged = out
            .iter_mut()
            .find(|existing| existing.node == term.node)
            .and_then(|existing| {
                let folded = existing.scale.try_add(&term.scale)?;
                existing.scale = folded;
                Some(())
            });
        if merged.is_none() {
            out.push(term);
        }
    }
    out
}

/// Express one term as a detached expression.
fn term_to_expr(graph: &Graph, term: &Term) -> Expr {
    let node = Expr::node(term.node);
    if term.scale.is_const(1.0) {
        node
    } else if term.scale.is_const(-1.0) {
        -node
    } else {
        let dtype = match graph.value_type(term.node) {
            Some(ty) => ty.dtype,
            None => DType::F32,
        };
        term.scale.to_expr(graph, dtype) * node
    }
}

/// Try to express `beta * L + alpha * M` as a single `Gemm`, where `M` must
/// be a `Dot22` output, possibly wrapped in a rank-reducing dimshuffle.
///
/// For the dimshuffled forms, `L` is lifted to rank 2 first and the `Gemm`
/// result is shuffled back down, so the replacement has the original shape.
/// Returns the expression and the `Dot22` output it consumed.
fn beta_l_plus_alpha_m(
    graph: &Graph,
    beta: &Scale,
    l: NodeId,
    alpha: &Scale,
    m: NodeId,
    recurse_flip: bool,
) -> Option<(Expr, NodeId)> {
    if let Some((producer, _)) = graph.producer(m) {
        let apply = graph.apply_node(producer);
        if apply.op == Op::Dot22 {
            let dtype = graph.value_type(m)?.dtype;
            let gemm = Expr::gemm(
                Expr::node(l),
                alpha.to_expr(graph, dtype),
                Expr::node(apply.inputs[0]),
                Expr::node(apply.inputs[1]),
                beta.to_expr(graph, dtype),
            );
            return Some((gemm, m));
        }
        if let Op::DimShuffle { order } = &apply.op {
            let inner = apply.inputs[0];
            let is_dot22 = graph
                .producer(inner)
                .map(|(inner_producer, _)| graph.apply_node(inner_producer).op == Op::Dot22)
                .unwrap_or(false);
            if is_dot22 {
                // A (m, 1) or (1, n) shaped product reduced to a vector, or
                // a (1, 1) product reduced to a scalar.
                let orders: Option<(&[ShuffleDim], &[ShuffleDim])> = match order.as_slice() {
                    [Axis(0)] => Some((&[Axis(0), NewAxis], &[Axis(0)])),
                    [Axis(1)] => Some((&[NewAxis, Axis(0)], &[Axis(1)])),
                    [] => Some((&[NewAxis, NewAxis], &[])),
                    _ => None,
                };
                if let Some((lift, lower)) = orders {
                    let (inner_producer, _) = graph.producer(inner)?;
                    let dot22 = graph.apply_node(inner_producer);
                    let dtype = graph.value_type(m)?.dtype;
                    let gemm = Expr::gemm(
                        Expr::node(l).dimshuffle(lift),
                        alpha.to_expr(graph, dtype),
                        Expr::node(dot22.inputs[0]),
                        Expr::node(dot22.inputs[1]),
                        beta.to_expr(graph, dtype),
                    );
                    return Some((gemm.dimshuffle(lower), inner));
                }
            }
        }
    }
    if recurse_flip {
        return beta_l_plus_alpha_m(graph, alpha, m, beta, l, false);
    }
    None
}

/// Scan a factored term list for a pair expressible as a `Gemm`, and
/// rebuild the whole sum around it.
fn gemm_from_terms(graph: &Graph, terms: &[Term]) -> Option<(Expr, NodeId)> {
    for i in 0..terms.len() {
        for j in (i + 1)..terms.len() {
            let ty_i = graph.value_type(terms[i].node)?;
            let ty_j = graph.value_type(terms[j].node)?;
            if !ty_i.same_class(&ty_j) {
                continue;
            }
            let Some((gemm, old_dot22)) = beta_l_plus_alpha_m(
                graph,
                &terms[i].scale,
                terms[i].node,
                &terms[j].scale,
                terms[j].node,
                true,
            ) else {
                continue;
            };
            let mut expr = gemm;
            for (k, term) in terms.iter().enumerate() {
                if k != i && k != j {
                    expr = expr + term_to_expr(graph, term);
                }
            }
            return Some((expr, old_dot22));
        }
    }
    None
}

/// The full canonicalize-factor-pair sequence for one `Add`/`Sub` apply.
fn gemm_from_apply(graph: &Graph, apply: NodeId) -> Option<(Expr, NodeId)> {
    let node = graph.apply_node(apply);
    if !matches!(node.op, Op::Add | Op::Sub) {
        return None;
    }
    let out = node.outputs[0];
    let out_ty = graph.value_type(out)?;
    // Rank-1 and rank-0 sums are still candidates: their products show up
    // as dimshuffle-wrapped Dot22 applies.
    if out_ty.rank() > 2 || !out_ty.dtype.is_float() {
        return None;
    }

    let mut terms = Vec::new();
    canonicalize_terms(graph, out, Scale::one(), &mut terms, None);
    if terms.len() < 2 {
        return None;
    }
    let terms = factor_terms(terms);
    let (expr, old_dot22) = gemm_from_terms(graph, &terms)?;

    // The synthesized root must match the replaced variable exactly, not
    // just be replacement-compatible: an accidental dtype or broadcast
    // change here would alter downstream semantics.
    let new_ty = expr.ty(graph).ok()?;
    if new_ty.dtype == out_ty.dtype && new_ty.same_class(&out_ty) {
        Some((expr, old_dot22))
    } else {
        None
    }
}

/// Fixed-point driver fusing sums of scaled matrix products into `Gemm`
/// applies.
///
/// Works through the graph in reverse topological order so that the
/// outermost sum of a nested expression is considered first. Each committed
/// replacement must make the consumed `Dot22` unreachable; a candidate
/// whose product is still needed elsewhere rolls back and is counted, not
/// retried.
pub struct GemmRewriter {}

impl GemmRewriter {
    pub fn new() -> GemmRewriter {
        GemmRewriter {}
    }

    fn apply_inner(
        &self,
        graph: &mut Graph,
        diag: &Diagnostics,
        tracker: crate::graph::ListenerId,
    ) -> Result<RewriteStats, OptimizeError> {
        let mut stats = RewriteStats::default();
        loop {
            stats.passes += 1;
            let mut changed = false;
            let mut worklist: Vec<NodeId> = graph.toposort()?;

            // Popping from the end walks the graph output-first.
            while let Some(apply) = worklist.pop() {
                if !is_live_apply(graph, apply) {
                    continue;
                }
                let Some((expr, old_dot22)) = gemm_from_apply(graph, apply) else {
                    continue;
                };
                let old_out = graph.apply_outputs(apply)[0];
                let new_out = match graph.import_expr(&expr) {
                    Ok(id) => id,
                    Err(ImportError::Type(error)) => {
                        return Err(OptimizeError::BadCandidate {
                            rule: self.name().to_string(),
                            error: ImportError::Type(error),
                        });
                    }
                    Err(ImportError::Inconsistency(_)) => {
                        stats.rejected_inconsistent += 1;
                        graph.prune_unreachable();
                        continue;
                    }
                };
                match graph.replace_all_validate_remove(
                    &[(old_out, new_out)],
                    &[old_dot22],
                    "GemmRewriter",
                ) {
                    Ok(()) => {
                        stats.replacements += 1;
                        changed = true;
                        // Reassociation changes summation order, so bitwise
                        // comparisons against the old value are off the
                        // table.
                        graph.mark_tolerant(new_out);
                        diag.info(graph, apply, format_args!("fused into gemm"));
                        if let Some(t) = graph.listener_downcast_mut::<ImportTracker>(tracker) {
                            worklist.extend(t.take_imported());
                        }
                    }
                    Err(ReplaceError::Inconsistent(_)) => {
                        stats.rejected_inconsistent += 1;
                        diag.warn(graph, apply, format_args!("gemm candidate rejected"));
                        self.discard_imports(graph, tracker);
                    }
                    Err(ReplaceError::DidNotRemove(_)) => {
                        stats.rejected_did_not_remove += 1;
                        diag.warn(
                            graph,
                            apply,
                            format_args!("gemm candidate left its dot22 reachable"),
                        );
                        self.discard_imports(graph, tracker);
                    }
                    Err(ReplaceError::Type(error)) => {
                        return Err(OptimizeError::BadCandidate {
                            rule: self.name().to_string(),
                            error: ImportError::Type(error),
                        });
                    }
                }
            }
            if !changed {
                return Ok(stats);
            }
        }
    }

    fn discard_imports(&self, graph: &mut Graph, tracker: crate::graph::ListenerId) {
        if let Some(t) = graph.listener_downcast_mut::<ImportTracker>(tracker) {
            t.take_imported();
        }
    }
}

impl Default for GemmRewriter {
    fn default() -> GemmRewriter {
        GemmRewriter::new()
    }
}

impl GraphRewriter for GemmRewriter {
    fn name(&self) -> &str {
        "gemm_rewriter"
    }

    fn apply(&self, graph: &mut Graph, diag: &Diagnostics) -> Result<RewriteStats, OptimizeError> {
        let tracker = graph.attach_listener(Box::<ImportTracker>::default());
        let result = self.apply_inner(graph, diag, tracker);
        graph.detach_listener(tracker);
        result
    }
}

/// Rewrite general `Dot` applies into `Dot22` between dimshuffles, so the
/// gemm machinery only has to recognize one product operator.
pub struct DotToDot22 {}

impl NodeRewriter for DotToDot22 {
    fn name(&self) -> &str {
        "dot_to_dot22"
    }

    fn rewrite(&self, graph: &Graph, apply: NodeId) -> RewriteOutcome {
        let node = graph.apply_node(apply);
        if node.op != Op::Dot {
            return RewriteOutcome::NoMatch;
        }
        let (x, y) = (node.inputs[0], node.inputs[1]);
        let (Some(tx), Some(ty)) = (graph.value_type(x), graph.value_type(y)) else {
            return RewriteOutcome::NoMatch;
        };
        if !tx.dtype.is_float() {
            return RewriteOutcome::NoMatch;
        }
        let xe = Expr::node(x);
        let ye = Expr::node(y);
        let expr = match (tx.rank(), ty.rank()) {
            (2, 2) => xe.dot22(ye),
            (2, 1) => xe
                .dot22(ye.dimshuffle(&[Axis(0), NewAxis]))
                .dimshuffle(&[Axis(0)]),
            (1, 2) => xe
                .dimshuffle(&[NewAxis, Axis(0)])
                .dot22(ye)
                .dimshuffle(&[Axis(1)]),
            (1, 1) => xe
                .dimshuffle(&[NewAxis, Axis(0)])
                .dot22(ye.dimshuffle(&[Axis(0), NewAxis]))
                .dimshuffle(&[]),
            _ => return RewriteOutcome::NoMatch,
        };
        RewriteOutcome::Replace(vec![expr])
    }
}

fn non_inplace_gemm_inputs(graph: &Graph, apply: NodeId) -> Option<[NodeId; 5]> {
    let node = graph.apply_node(apply);
    if node.op != (Op::Gemm { inplace: false }) {
        return None;
    }
    node.inputs.as_slice().try_into().ok()
}

/// Rewrite a `Gemm` whose accumulator and one operand are statically a
/// single row (or column) into a `Gemv` between dimshuffles.
pub struct GemmToGemv {}

impl NodeRewriter for GemmToGemv {
    fn name(&self) -> &str {
        "gemm_to_gemv"
    }

    fn rewrite(&self, graph: &Graph, apply: NodeId) -> RewriteOutcome {
        let Some([z, a, x, y, b]) = non_inplace_gemm_inputs(graph, apply) else {
            return RewriteOutcome::NoMatch;
        };
        let (Some(tz), Some(tx), Some(ty)) = (
            graph.value_type(z),
            graph.value_type(x),
            graph.value_type(y),
        ) else {
            return RewriteOutcome::NoMatch;
        };

        if tz.shape[0].is_one() && tx.shape[0].is_one() {
            // (1, n) result: row of z times y, using the transpose.
            let gemv = Expr::gemv(
                Expr::node(z).dimshuffle(&[Axis(1)]),
                Expr::node(a),
                Expr::node(y).dimshuffle(&[Axis(1), Axis(0)]),
                Expr::node(x).dimshuffle(&[Axis(1)]),
                Expr::node(b),
            );
            RewriteOutcome::Replace(vec![gemv.dimshuffle(&[NewAxis, Axis(0)])])
        } else if tz.shape[1].is_one() && ty.shape[1].is_one() {
            // (m, 1) result.
            let gemv = Expr::gemv(
                Expr::node(z).dimshuffle(&[Axis(0)]),
                Expr::node(a),
                Expr::node(x),
                Expr::node(y).dimshuffle(&[Axis(0)]),
                Expr::node(b),
            );
            RewriteOutcome::Replace(vec![gemv.dimshuffle(&[Axis(0), NewAxis])])
        } else {
            RewriteOutcome::NoMatch
        }
    }
}

/// Rewrite a `Gemm` over an outer product (`x` a column, `y` a row) with
/// constant `beta == 1` into a `Ger`.
pub struct GemmToGer {}

impl NodeRewriter for GemmToGer {
    fn name(&self) -> &str {
        "gemm_to_ger"
    }

    fn rewrite(&self, graph: &Graph, apply: NodeId) -> RewriteOutcome {
        let Some([z, a, x, y, b]) = non_inplace_gemm_inputs(graph, apply) else {
            return RewriteOutcome::NoMatch;
        };
        let (Some(tx), Some(ty)) = (graph.value_type(x), graph.value_type(y)) else {
            return RewriteOutcome::NoMatch;
        };
        if !(tx.shape[1].is_one() && ty.shape[0].is_one()) {
            return RewriteOutcome::NoMatch;
        }
        // Only beta == 1 folds away; other values would need an extra
        // scaling apply which defeats the point.
        if constant_scalar(graph, b) != Some(1.0) {
            return RewriteOutcome::NoMatch;
        }
        let ger = Expr::ger(
            Expr::node(z),
            Expr::node(a),
            Expr::node(x).dimshuffle(&[Axis(0)]),
            Expr::node(y).dimshuffle(&[Axis(1)]),
        );
        RewriteOutcome::Replace(vec![ger])
    }
}
