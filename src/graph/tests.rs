use smallvec::smallvec;

use crate::downcast::DowncastDyn;
use crate::graph::builder::Expr;
use crate::graph::{
    ChangeTarget, DestroyGuard, Graph, GraphListener, ImportError, InconsistencyError, Node,
    NodeId, ReplaceError, RunError,
};
use crate::ops::ShuffleDim::Axis;
use crate::ops::{Op, TypeError};
use crate::value::{DType, Value, ValueType};

fn mat_ty() -> ValueType {
    ValueType::matrix(DType::F32)
}

fn scalar_ty() -> ValueType {
    ValueType::scalar(DType::F32)
}

/// Render the live part of the graph as comparable text, including client
/// list ordering, for checking that a rolled-back batch left no residue.
fn snapshot(graph: &Graph) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for (id, node) in graph.iter() {
        let clients = graph.clients(id);
        let line = match node {
            Node::Apply(apply) => {
                format!("{}: apply {} {:?} -> {:?}", id, apply.op, apply.inputs, apply.outputs)
            }
            Node::Value(value) => format!("{}: value {} {:?}", id, value.ty(), clients),
            Node::Constant(_) => format!("{}: const {:?}", id, clients),
        };
        lines.push(line);
    }
    lines.push(format!("inputs {:?}", graph.input_ids()));
    lines.push(format!("outputs {:?}", graph.output_ids()));
    lines
}

#[test]
fn test_add_apply_infers_and_indexes() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), mat_ty());
    let y = g.add_value(Some("y"), mat_ty());
    let dot = g.add_apply(Some("dot"), Op::Dot22, &[x, y]).unwrap();
    let out = g.apply_outputs(dot)[0];

    assert_eq!(g.value_type(out), Some(mat_ty()));
    assert_eq!(g.clients(x), &[(dot, 0)]);
    assert_eq!(g.clients(y), &[(dot, 1)]);
    assert_eq!(g.producer(out), Some((dot, 0)));
    assert_eq!(g.apply_count(), 1);
}

#[test]
fn test_add_apply_type_error() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), mat_ty());
    let v = g.add_value(Some("v"), ValueType::vector(DType::F32));
    let result = g.add_apply(None, Op::Dot22, &[x, v]);
    assert!(matches!(
        result,
        Err(ImportError::Type(TypeError::WrongRank { input: 1, .. }))
    ));
    // The failed apply left nothing behind.
    assert_eq!(g.apply_count(), 0);
    assert_eq!(g.clients(x), &[]);
}

#[test]
fn test_add_apply_rejects_destructive_alias() {
    let mut g = Graph::new();
    let z = g.add_value(Some("z"), mat_ty());
    let y = g.add_value(Some("y"), mat_ty());
    let alpha = g.add_constant(None, 1.0f32);
    let beta = g.add_constant(None, 1.0f32);

    // A transpose of z is a view of z's storage, so using it as the x
    // operand of an inplace gemm would read storage the gemm overwrites.
    let transpose = g
        .add_apply(
            None,
            Op::DimShuffle {
                order: smallvec![Axis(1), Axis(0)],
            },
            &[z],
        )
        .unwrap();
    let zt = g.apply_outputs(transpose)[0];

    let result = g.add_apply(None, Op::Gemm { inplace: true }, &[z, alpha, zt, y, beta]);
    assert!(matches!(
        result,
        Err(ImportError::Inconsistency(InconsistencyError::AliasHazard(_)))
    ));

    // The non-destructive variant is fine.
    let ok = g.add_apply(None, Op::Gemm { inplace: false }, &[z, alpha, zt, y, beta]);
    assert!(ok.is_ok());
}

#[test]
fn test_toposort_orders_producers_first() {
    let x = Expr::value("x", scalar_ty());
    let y = Expr::value("y", scalar_ty());
    let sum = x + y;
    let graph = (sum.clone() * sum).make_graph().unwrap();

    let order = graph.toposort().unwrap();
    assert_eq!(order.len(), 2);
    let first = &graph.apply_node(order[0]).op;
    let second = &graph.apply_node(order[1]).op;
    assert_eq!(*first, Op::Add);
    assert_eq!(*second, Op::Mul);
}

#[test]
fn test_replace_commits_and_prunes() {
    let x = Expr::value("x", scalar_ty());
    let y = Expr::value("y", scalar_ty());
    let mut g = (x + y).make_graph().unwrap();
    let (x_id, y_id) = (g.input_ids()[0], g.input_ids()[1]);
    let old_out = g.output_ids()[0];

    let new_out = g
        .import_expr(&(Expr::node(x_id) * Expr::node(y_id)))
        .unwrap();
    g.replace_all_validate(&[(old_out, new_out)], "prefer_mul")
        .unwrap();

    assert_eq!(g.output_ids(), &[new_out]);
    assert_eq!(g.apply_count(), 1);
    assert!(g.node(old_out).is_none());

    // The client index is exact: x is read only by the surviving Mul.
    let (mul_apply, _) = g.producer(new_out).unwrap();
    assert_eq!(g.clients(x_id), &[(mul_apply, 0)]);
    assert_eq!(g.clients(y_id), &[(mul_apply, 1)]);

    // Provenance carried over.
    let trace = g.node(new_out).unwrap().as_value().unwrap().trace();
    assert_eq!(trace, ["prefer_mul".to_string()]);
}

struct RejectAll {}

impl GraphListener for RejectAll {
    fn validate(&self, _graph: &Graph) -> Result<(), InconsistencyError> {
        Err(InconsistencyError::TypeMismatch("vetoed"))
    }
}

#[test]
fn test_replace_rollback_is_exact() {
    let x = Expr::value("x", scalar_ty());
    let y = Expr::value("y", scalar_ty());
    let mut g = (x + y).make_graph().unwrap();
    let (x_id, y_id) = (g.input_ids()[0], g.input_ids()[1]);
    let old_out = g.output_ids()[0];

    g.attach_listener(Box::new(RejectAll {}));
    let before = snapshot(&g);

    let new_out = g
        .import_expr(&(Expr::node(x_id) * Expr::node(y_id)))
        .unwrap();
    let err = g
        .replace_all_validate(&[(old_out, new_out)], "prefer_mul")
        .unwrap_err();
    assert!(matches!(
        err,
        ReplaceError::Inconsistent(InconsistencyError::TypeMismatch(_))
    ));

    // The failed candidate is gone and every edge is back where it was.
    assert_eq!(snapshot(&g), before);
}

#[test]
fn test_rollback_restores_client_order() {
    // A variable with several consumers: undoing a failed batch must put
    // its client entries back in their original order, not just restore
    // membership.
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), scalar_ty());
    let y = g.add_value(Some("y"), scalar_ty());
    let sum = g.add_apply(None, Op::Add, &[x, y]).unwrap();
    let s = g.apply_outputs(sum)[0];
    let m1 = g.add_apply(None, Op::Mul, &[s, x]).unwrap();
    let m2 = g.add_apply(None, Op::Sub, &[s, y]).unwrap();
    let o1 = g.apply_outputs(m1)[0];
    let o2 = g.apply_outputs(m2)[0];
    let fin = g.add_apply(None, Op::Add, &[o1, o2]).unwrap();
    let f_out = g.apply_outputs(fin)[0];
    g.set_input_ids(&[x, y]);
    g.set_output_ids(&[f_out]);
    assert_eq!(g.clients(s), &[(m1, 0), (m2, 0)]);

    g.attach_listener(Box::new(RejectAll {}));
    let before = snapshot(&g);

    let err = g.replace_all_validate(&[(s, x)], "fold").unwrap_err();
    assert!(matches!(err, ReplaceError::Inconsistent(_)));
    assert_eq!(g.clients(s), &[(m1, 0), (m2, 0)]);
    assert_eq!(snapshot(&g), before);
}

#[test]
fn test_replace_rejects_cycle() {
    let x = Expr::value("x", scalar_ty());
    let sum = x + 1.0f32;
    let mut g = (sum * 2.0f32).make_graph().unwrap();
    let x_id = g.input_ids()[0];
    let out = g.output_ids()[0];

    // Feeding the final product back in as the Add operand makes a loop.
    let err = g.replace_all_validate(&[(x_id, out)], "loop").unwrap_err();
    assert_eq!(err, ReplaceError::Inconsistent(InconsistencyError::Cycle));

    // Rolled back and still executable.
    let result = g.run(vec![(x_id, Value::from(3.0f32))], &[out]).unwrap();
    assert_eq!(result[0], Value::from(8.0f32));
}

#[test]
fn test_replace_type_mismatch() {
    let x = Expr::value("x", mat_ty());
    let y = Expr::value("y", mat_ty());
    let mut g = (x + y).make_graph().unwrap();
    let out = g.output_ids()[0];
    let vec = g.add_value(Some("v"), ValueType::vector(DType::F32));

    let err = g.replace_all_validate(&[(out, vec)], "bad").unwrap_err();
    assert!(matches!(
        err,
        ReplaceError::Type(TypeError::IncompatibleReplacement { .. })
    ));
}

#[test]
fn test_replace_remove_enforced() {
    let mut g = Graph::new();
    let x = g.add_value(Some("x"), scalar_ty());
    let y = g.add_value(Some("y"), scalar_ty());
    let mul = g.add_apply(None, Op::Mul, &[x, y]).unwrap();
    let m_out = g.apply_outputs(mul)[0];
    let add = g.add_apply(None, Op::Add, &[m_out, x]).unwrap();
    let a_out = g.apply_outputs(add)[0];
    g.set_input_ids(&[x, y]);

    // While the product is itself a graph output, a batch that requires its
    // removal must roll back whole.
    g.set_output_ids(&[a_out, m_out]);
    let err = g
        .replace_all_validate_remove(&[(a_out, x)], &[m_out], "shrink")
        .unwrap_err();
    assert!(matches!(err, ReplaceError::DidNotRemove(id) if id == m_out));
    assert_eq!(g.output_ids(), &[a_out, m_out]);
    assert_eq!(g.apply_count(), 2);

    // Once the product is internal, the same batch goes through and prunes
    // both applies.
    g.set_output_ids(&[a_out]);
    g.replace_all_validate_remove(&[(a_out, x)], &[m_out], "shrink")
        .unwrap();
    assert!(g.node(m_out).is_none());
    assert_eq!(g.apply_count(), 0);
    // Unused inputs are never pruned.
    assert!(g.node(y).is_some());
}

#[derive(Default)]
struct EventLog {
    events: Vec<String>,
}

impl GraphListener for EventLog {
    fn on_attach(&mut self, _graph: &Graph) {
        self.events.push("attach".into());
    }

    fn on_detach(&mut self, _graph: &Graph) {
        self.events.push("detach".into());
    }

    fn on_import(&mut self, _graph: &Graph, _apply: NodeId) {
        self.events.push("import".into());
    }

    fn on_prune(&mut self, _graph: &Graph, _apply: NodeId) {
        self.events.push("prune".into());
    }

    fn on_change_input(
        &mut self,
        _graph: &Graph,
        target: ChangeTarget,
        _old: NodeId,
        _new: NodeId,
    ) {
        match target {
            ChangeTarget::Apply { .. } => self.events.push("change_input".into()),
            ChangeTarget::GraphOutput { .. } => self.events.push("change_output".into()),
        }
    }
}

#[test]
fn test_listener_event_sequence() {
    let x = Expr::value("x", scalar_ty());
    let y = Expr::value("y", scalar_ty());
    let mut g = (x + y).make_graph().unwrap();
    let (x_id, y_id) = (g.input_ids()[0], g.input_ids()[1]);
    let old_out = g.output_ids()[0];

    let listener_id = g.attach_listener(Box::<EventLog>::default());

    let new_out = g
        .import_expr(&(Expr::node(x_id) * Expr::node(y_id)))
        .unwrap();
    g.replace_all_validate(&[(old_out, new_out)], "r").unwrap();

    let log = g.listener_downcast_mut::<EventLog>(listener_id).unwrap();
    assert_eq!(log.events, ["attach", "import", "change_output", "prune"]);

    let detached = g.detach_listener(listener_id).unwrap();
    let log = detached.as_ref().downcast_ref::<EventLog>().unwrap();
    assert_eq!(log.events.last().map(|s| s.as_str()), Some("detach"));

    // Detached listeners are gone.
    assert!(g.listener_downcast_mut::<EventLog>(listener_id).is_none());
}

fn inplace_gemm(z: Expr) -> Expr {
    let x = Expr::value("u", mat_ty());
    let y = Expr::value("v", mat_ty());
    Expr::apply(
        Op::Gemm { inplace: true },
        &[
            z,
            Expr::constant(1.0f32),
            x,
            y,
            Expr::constant(1.0f32),
        ],
    )
}

#[test]
fn test_destroy_guard_allows_private_accumulator() {
    let z = Expr::value("a", mat_ty()) + Expr::value("b", mat_ty());
    let g = inplace_gemm(z).make_graph().unwrap();
    assert!(DestroyGuard::new().validate(&g).is_ok());
}

#[test]
fn test_destroy_guard_rejects_graph_input() {
    let z = Expr::value("z", mat_ty());
    let g = inplace_gemm(z).make_graph().unwrap();
    assert!(matches!(
        DestroyGuard::new().validate(&g),
        Err(InconsistencyError::AliasHazard(_))
    ));
}

#[test]
fn test_destroy_guard_rejects_sibling_consumer() {
    let z = Expr::value("a", mat_ty()) + Expr::value("b", mat_ty());
    let mut g = inplace_gemm(z).make_graph().unwrap();
    let gemm_out = g.output_ids()[0];

    // Find the accumulator (the Add output) and hang a second consumer off
    // it that is also a graph output.
    let z_out = g
        .iter()
        .find_map(|(_, node)| match node {
            Node::Apply(apply) if apply.op == Op::Add => Some(apply.outputs[0]),
            _ => None,
        })
        .unwrap();
    let extra = g
        .import_expr(&(Expr::node(z_out) + Expr::node(z_out)))
        .unwrap();
    g.set_output_ids(&[gemm_out, extra]);

    assert!(matches!(
        DestroyGuard::new().validate(&g),
        Err(InconsistencyError::AliasHazard(_))
    ));
}

#[test]
fn test_destroy_guard_allows_upstream_consumer() {
    // The other reader of the accumulator feeds the destroyer, so it always
    // runs first.
    let mut g = Graph::new();
    let a = g.add_value(Some("a"), mat_ty());
    let b = g.add_value(Some("b"), mat_ty());
    let alpha = g.add_constant(None, 1.0f32);
    let beta = g.add_constant(None, 1.0f32);

    let acc = g.add_apply(None, Op::Add, &[a, b]).unwrap();
    let acc_out = g.apply_outputs(acc)[0];
    let reader = g.add_apply(None, Op::Add, &[acc_out, b]).unwrap();
    let reader_out = g.apply_outputs(reader)[0];
    let gemm = g
        .add_apply(
            None,
            Op::Gemm { inplace: true },
            &[acc_out, alpha, reader_out, b, beta],
        )
        .unwrap();
    g.set_input_ids(&[a, b]);
    g.set_output_ids(&[g.apply_outputs(gemm)[0]]);

    assert!(DestroyGuard::new().validate(&g).is_ok());
}

#[test]
fn test_run_reports_missing_input() {
    let x = Expr::value("x", scalar_ty());
    let g = (x + 1.0f32).make_graph().unwrap();
    let out = g.output_ids()[0];
    let err = g.run(Vec::new(), &[out]).unwrap_err();
    assert!(matches!(err, RunError::MissingInput(_)));
}
