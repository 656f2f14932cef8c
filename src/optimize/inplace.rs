//! In-place specialization of BLAS applies.
//!
//! Runs late in the pipeline: every non-destructive `Gemm`/`Gemv`/`Ger` is
//! offered a destructive replacement, and a [`DestroyGuard`] attached for
//! the duration of the pass vetoes the ones whose accumulator storage is
//! still needed elsewhere. A veto rolls the candidate back and is counted;
//! it never fails the pass.

use crate::graph::builder::Expr;
use crate::graph::{DestroyGuard, Graph, NodeId};
use crate::ops::Op;
use crate::optimize::{
    Diagnostics, GraphRewriter, InOutPass, NodeRewriter, OptimizeError, RewriteOutcome,
    RewriteStats,
};

/// Rule mapping non-destructive BLAS applies to their destructive variants.
pub struct InplaceBlas {}

impl NodeRewriter for InplaceBlas {
    fn name(&self) -> &str {
        "inplace_blas"
    }

    fn rewrite(&self, graph: &Graph, apply: NodeId) -> RewriteOutcome {
        let node = graph.apply_node(apply);
        let destructive = match node.op {
            Op::Gemm { inplace: false } => Op::Gemm { inplace: true },
            Op::Gemv { inplace: false } => Op::Gemv { inplace: true },
            Op::Ger { destructive: false } => Op::Ger { destructive: true },
            _ => return RewriteOutcome::NoMatch,
        };
        let inputs: Vec<Expr> = node.inputs.iter().map(|&id| Expr::node(id)).collect();
        RewriteOutcome::Replace(vec![Expr::apply(destructive, &inputs)])
    }
}

/// Driver running [`InplaceBlas`] with a [`DestroyGuard`] attached.
pub struct InplacePass {}

impl InplacePass {
    pub fn new() -> InplacePass {
        InplacePass {}
    }
}

impl Default for InplacePass {
    fn default() -> InplacePass {
        InplacePass::new()
    }
}

impl GraphRewriter for InplacePass {
    fn name(&self) -> &str {
        "inplace_blas"
    }

    fn apply(&self, graph: &mut Graph, diag: &Diagnostics) -> Result<RewriteStats, OptimizeError> {
        let guard = graph.attach_listener(Box::new(DestroyGuard::new()));
        let pass = InOutPass::new("inplace_blas", vec![Box::new(InplaceBlas {})]);
        let result = pass.apply(graph, diag);
        graph.detach_listener(guard);
        result
    }
}
