//! symgraph is a rewrite engine for symbolic tensor expression graphs.
//!
//! A [`Graph`] holds variables, constants and operator applications with
//! exact client/producer indices, an observer bus ([`GraphListener`]) and an
//! atomic replace-validate-rollback mutation protocol. On top of it,
//! [`optimize`] provides local rewrite rules, drivers that schedule them,
//! and the standard BLAS specialization pipeline which fuses sums of scaled
//! matrix products into `Gemm`/`Gemv`/`Ger` applies and finally makes them
//! destructive where that is provably safe.
//!
//! ```
//! use symgraph::builder::Expr;
//! use symgraph::{blas_pipeline, DType, Diagnostics, ValueType};
//!
//! let z = Expr::value("z", ValueType::matrix(DType::F32));
//! let x = Expr::value("x", ValueType::matrix(DType::F32));
//! let y = Expr::value("y", ValueType::matrix(DType::F32));
//! let mut graph = (z + Expr::constant(2.0f32) * x.dot22(y)).make_graph().unwrap();
//!
//! let stats = blas_pipeline()
//!     .run(&mut graph, &["fast_run"], &["inplace"], &Diagnostics::new())
//!     .unwrap();
//! assert_eq!(stats.replacements, 1); // the whole sum fused into one Gemm
//! assert_eq!(graph.apply_count(), 1);
//! ```

mod downcast;
pub mod env;
pub mod graph;
pub mod ops;
pub mod optimize;
pub mod value;

pub use graph::builder;
pub use graph::{
    ApplyNode, ChangeTarget, Constant, DestroyGuard, Graph, GraphListener, ImportError,
    InconsistencyError, ListenerId, Node, NodeId, ReplaceError, RunError, ValueNode,
};
pub use ops::kernels::OpError;
pub use ops::{Op, ShuffleDim, TypeError};
pub use optimize::{
    blas_pipeline, DiagnosticLevel, Diagnostics, EquilibriumPass, GemmRewriter, GraphRewriter,
    InOutPass, NodeRewriter, OptimizeError, RewriteDatabase, RewriteOutcome, RewriteStats,
};
pub use value::{DType, Dimension, Value, ValueType};
