//! Detached construction of graph fragments.
//!
//! Expressions are built with constructor methods and math operators without
//! touching any graph, then materialized with [`Graph::import_expr`] or
//! [`Expr::make_graph`]. Rewriters return candidate replacements as
//! expressions, so a candidate that is never committed costs nothing.
//!
//! ```
//! use symgraph::builder::Expr;
//! use symgraph::{DType, ValueType};
//!
//! let x = Expr::value("x", ValueType::matrix(DType::F32));
//! let y = Expr::value("y", ValueType::matrix(DType::F32));
//! let expr = x.clone().dot22(y) + x;
//! let graph = expr.make_graph().unwrap();
//! ```

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Mul, Neg, Sub};
use std::rc::Rc;

use smallvec::SmallVec;

use crate::graph::{Graph, ImportError, InconsistencyError, NodeId};
use crate::ops::{Op, ShuffleDim};
use crate::value::{Value, ValueType};

enum ExprKind {
    /// Reference to a variable already in the target graph.
    Node(NodeId),
    /// A named runtime-computed value.
    Value { name: String, ty: ValueType },
    /// A constant.
    Constant(Value),
    /// An operator applied to sub-expressions.
    Apply { op: Op, inputs: Vec<Expr> },
}

/// An expression describing a graph fragment.
///
/// Cloning an expression is cheap and clones share identity: importing a
/// tree that contains the same expression twice creates the node once.
#[derive(Clone)]
pub struct Expr {
    kind: Rc<ExprKind>,
}

impl From<ExprKind> for Expr {
    fn from(kind: ExprKind) -> Expr {
        Expr { kind: kind.into() }
    }
}

impl Expr {
    /// Create an expression referring to a variable already in the graph
    /// this expression will be imported into.
    pub fn node(id: NodeId) -> Expr {
        Expr::from(ExprKind::Node(id))
    }

    /// Create an expression representing a runtime-computed value.
    pub fn value(name: &str, ty: ValueType) -> Expr {
        Expr::from(ExprKind::Value {
            name: name.to_string(),
            ty,
        })
    }

    /// Create an expression representing a constant.
    pub fn constant<V: Into<Value>>(value: V) -> Expr {
        Expr::from(ExprKind::Constant(value.into()))
    }

    /// Create an expression which applies an operator to operands.
    pub fn apply(op: Op, inputs: &[Expr]) -> Expr {
        Expr::from(ExprKind::Apply {
            op,
            inputs: inputs.to_vec(),
        })
    }

    pub fn unary(&self, op: Op) -> Expr {
        Expr::apply(op, std::slice::from_ref(self))
    }

    pub fn binary(&self, op: Op, rhs: Expr) -> Expr {
        Expr::apply(op, &[self.clone(), rhs])
    }

    pub fn dot(&self, rhs: Expr) -> Expr {
        self.binary(Op::Dot, rhs)
    }

    pub fn dot22(&self, rhs: Expr) -> Expr {
        self.binary(Op::Dot22, rhs)
    }

    pub fn dimshuffle(&self, order: &[ShuffleDim]) -> Expr {
        self.unary(Op::DimShuffle {
            order: SmallVec::from_slice(order),
        })
    }

    pub fn gemm(z: Expr, alpha: Expr, x: Expr, y: Expr, beta: Expr) -> Expr {
        Expr::apply(Op::Gemm { inplace: false }, &[z, alpha, x, y, beta])
    }

    pub fn gemv(y: Expr, alpha: Expr, a: Expr, x: Expr, beta: Expr) -> Expr {
        Expr::apply(Op::Gemv { inplace: false }, &[y, alpha, a, x, beta])
    }

    pub fn ger(a: Expr, alpha: Expr, x: Expr, y: Expr) -> Expr {
        Expr::apply(Op::Ger { destructive: false }, &[a, alpha, x, y])
    }

    /// Compute the static type this expression will have once imported into
    /// `graph`.
    pub fn ty(&self, graph: &Graph) -> Result<ValueType, ImportError> {
        match self.kind.as_ref() {
            ExprKind::Node(id) => graph.value_type(*id).ok_or(ImportError::Inconsistency(
                InconsistencyError::TypeMismatch("expression references a missing variable"),
            )),
            ExprKind::Value { ty, .. } => Ok(ty.clone()),
            ExprKind::Constant(value) => Ok(value.value_type()),
            ExprKind::Apply { op, inputs } => {
                let input_types = inputs
                    .iter()
                    .map(|input| input.ty(graph))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut output_types = op.infer_types(&input_types)?;
                Ok(output_types.remove(0))
            }
        }
    }

    /// Create a graph whose single output is this expression.
    ///
    /// Every `Expr::value` leaf becomes a graph input, in first-use order.
    pub fn make_graph(&self) -> Result<Graph, ImportError> {
        let mut graph = Graph::new();
        let mut memo = HashMap::new();
        let output = self.import(&mut graph, &mut memo)?;

        let mut input_ids = Vec::new();
        for (id, node) in graph.iter() {
            if node.as_value().is_some() && graph.producer(id).is_none() {
                input_ids.push(id);
            }
        }
        graph.set_input_ids(&input_ids);
        graph.set_output_ids(&[output]);
        Ok(graph)
    }

    fn import(
        &self,
        graph: &mut Graph,
        memo: &mut HashMap<ExprRef, NodeId>,
    ) -> Result<NodeId, ImportError> {
        if let Some(&id) = memo.get(&ExprRef(self.clone())) {
            return Ok(id);
        }

        let id = match self.kind.as_ref() {
            ExprKind::Node(id) => {
                if graph.value_type(*id).is_none() {
                    return Err(ImportError::Inconsistency(InconsistencyError::TypeMismatch(
                        "expression references a missing variable",
                    )));
                }
                *id
            }
            ExprKind::Value { name, ty } => graph.add_value(Some(name.as_str()), ty.clone()),
            ExprKind::Constant(value) => graph.add_constant(None, value.clone()),
            ExprKind::Apply { op, inputs } => {
                let input_ids = inputs
                    .iter()
                    .map(|input| input.import(graph, memo))
                    .collect::<Result<Vec<_>, _>>()?;
                let apply = graph.add_apply(None, op.clone(), &input_ids)?;
                graph.apply_outputs(apply)[0]
            }
        };
        memo.insert(ExprRef(self.clone()), id);
        Ok(id)
    }
}

impl Graph {
    /// Materialize an expression in this graph, returning the variable that
    /// holds its result.
    ///
    /// Sub-expressions shared within the tree (clones of one `Expr`) are
    /// imported once. `Expr::node` leaves resolve to the variables they
    /// reference without creating anything.
    pub fn import_expr(&mut self, expr: &Expr) -> Result<NodeId, ImportError> {
        let mut memo = HashMap::new();
        expr.import(self, &mut memo)
    }
}

/// Wrapper around an `Expr` which uses reference-equality.
struct ExprRef(Expr);

impl PartialEq for ExprRef {
    fn eq(&self, other: &ExprRef) -> bool {
        Rc::ptr_eq(&self.0.kind, &other.0.kind)
    }
}

impl Eq for ExprRef {}

impl Hash for ExprRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0.kind).hash(state)
    }
}

macro_rules! impl_binary_op {
    ($op_trait:ident, $op_method:ident, $op_variant:ident) => {
        impl $op_trait for Expr {
            type Output = Expr;

            fn $op_method(self, rhs: Expr) -> Expr {
                self.binary(Op::$op_variant, rhs)
            }
        }

        impl<V> $op_trait<V> for Expr
        where
            V: Into<Value>,
        {
            type Output = Expr;

            fn $op_method(self, rhs: V) -> Expr {
                self.binary(Op::$op_variant, Expr::constant(rhs))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Sub);
impl_binary_op!(Mul, mul, Mul);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.unary(Op::Neg)
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::Expr;
    use crate::value::{DType, Value, ValueType};

    #[test]
    fn test_make_graph() {
        // Build an expression featuring values, operators and constants,
        // including re-use of the same sub-expression.
        let x = Expr::value("x", ValueType::scalar(DType::F32));
        let x_sqr = x.clone() * x.clone();
        let x_4_plus_2 = x_sqr.clone() * x_sqr + 2.0f32;
        let graph = x_4_plus_2.make_graph().unwrap();

        assert_eq!(graph.input_ids().len(), 1);
        assert_eq!(graph.apply_count(), 3);

        let in_id = graph.input_ids()[0];
        let out_id = graph.output_ids()[0];
        let result = graph
            .run(vec![(in_id, Value::from(4.0f32))], &[out_id])
            .unwrap();

        let expected = (4.0f32).powf(4.0) + 2.0;
        assert_eq!(result[0], Value::from(Tensor::from(expected)));
    }

    #[test]
    fn test_import_dedups_shared_subexprs() {
        let x = Expr::value("x", ValueType::scalar(DType::F32));
        let x_sqr = x.clone() * x;
        let sum = x_sqr.clone() + x_sqr;
        let graph = sum.make_graph().unwrap();

        // One Mul (shared) and one Add.
        assert_eq!(graph.apply_count(), 2);
    }

    #[test]
    fn test_node_expr_splices_into_live_graph() {
        let x = Expr::value("x", ValueType::scalar(DType::F32));
        let mut graph = (x.clone() + 1.0f32).make_graph().unwrap();
        let sum = graph.output_ids()[0];

        let doubled = Expr::node(sum) * 2.0f32;
        let new_out = graph.import_expr(&doubled).unwrap();
        graph.set_output_ids(&[new_out]);

        let in_id = graph.input_ids()[0];
        let result = graph
            .run(vec![(in_id, Value::from(3.0f32))], &[new_out])
            .unwrap();
        assert_eq!(result[0], Value::from(8.0f32));
    }
}
