//! Observer interface for graph mutations.
//!
//! Listeners are attached to a [`Graph`] and receive synchronous callbacks
//! for every structural change, plus a `validate` hook that can veto a batch
//! of changes before it commits. Rewrite drivers use listeners to track
//! imported applies; [`DestroyGuard`] uses the validate hook to keep
//! destructive operators safe.

use std::any::Any;

use crate::downcast::impl_downcastdyn;
use crate::graph::{Graph, InconsistencyError, Node, NodeId};

/// Identifier of an attached listener, returned by
/// [`Graph::attach_listener`](crate::Graph::attach_listener).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListenerId(pub(super) usize);

/// The edge being rewired by a replacement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChangeTarget {
    /// Input `slot` of `apply`.
    Apply { apply: NodeId, slot: usize },
    /// Entry `index` of the graph's output list.
    GraphOutput { index: usize },
}

/// Callbacks fired by a [`Graph`] as it changes.
///
/// All methods have no-op defaults. Listeners fire in registration order.
/// The graph passed to each callback reflects the change that triggered it.
#[allow(unused_variables)]
pub trait GraphListener: Any {
    /// Called when the listener is attached to a graph.
    fn on_attach(&mut self, graph: &Graph) {}

    /// Called when the listener is detached.
    fn on_detach(&mut self, graph: &Graph) {}

    /// Called after an apply (and its output values) joins the graph.
    fn on_import(&mut self, graph: &Graph, apply: NodeId) {}

    /// Called just before an unreachable apply is dropped.
    fn on_prune(&mut self, graph: &Graph, apply: NodeId) {}

    /// Called after an edge is rewired from `old` to `new`.
    fn on_change_input(&mut self, graph: &Graph, target: ChangeTarget, old: NodeId, new: NodeId) {}

    /// Check a graph-wide invariant. Returning an error causes the current
    /// replacement batch to roll back.
    fn validate(&self, graph: &Graph) -> Result<(), InconsistencyError> {
        Ok(())
    }
}

impl_downcastdyn!(GraphListener);

/// Listener enforcing safe use of destructive operators.
///
/// An apply whose operator declares a [`destroy_map`](crate::Op::destroy_map)
/// overwrites the storage of one of its inputs. This guard rejects any batch
/// that leaves the graph with a destroyer whose overwritten storage is still
/// needed elsewhere: by the caller (graph inputs and outputs), by a constant,
/// or by a consumer that cannot be proven to run before the destroyer.
#[derive(Default)]
pub struct DestroyGuard {}

impl DestroyGuard {
    pub fn new() -> DestroyGuard {
        DestroyGuard {}
    }
}

impl GraphListener for DestroyGuard {
    fn validate(&self, graph: &Graph) -> Result<(), InconsistencyError> {
        // Applies disconnected by the batch under validation are pruned only
        // after it commits; they no longer count as consumers.
        let live = graph.reachable_set();

        // (apply, destroyed input slot, storage root of that input)
        let mut destroyers: Vec<(NodeId, usize, NodeId)> = Vec::new();
        for (id, node) in graph.iter() {
            if let Node::Apply(apply) = node {
                if !live.contains(&id) {
                    continue;
                }
                if let Some((_, slot)) = apply.op.destroy_map() {
                    destroyers.push((id, slot, graph.storage_root(apply.inputs[slot])));
                }
            }
        }

        for (i, &(destroyer, slot, root)) in destroyers.iter().enumerate() {
            if destroyers[..i].iter().any(|&(_, _, other)| other == root) {
                return Err(InconsistencyError::AliasHazard(
                    "storage destroyed by more than one apply",
                ));
            }
            if matches!(graph.node(root), Some(Node::Constant(_))) {
                return Err(InconsistencyError::AliasHazard(
                    "a constant's storage would be overwritten",
                ));
            }
            if graph.input_ids().contains(&root) {
                return Err(InconsistencyError::AliasHazard(
                    "a graph input's storage would be overwritten",
                ));
            }

            let inputs = graph.apply_node(destroyer).inputs.clone();
            for (other_slot, &input) in inputs.iter().enumerate() {
                if other_slot != slot && graph.storage_root(input) == root {
                    return Err(InconsistencyError::AliasHazard(
                        "an apply both reads and overwrites the same storage",
                    ));
                }
            }

            // Every other consumer of the storage (through any view of it)
            // must run before the destroyer.
            for (id, node) in graph.iter() {
                if matches!(node, Node::Apply(_))
                    || !live.contains(&id)
                    || graph.storage_root(id) != root
                {
                    continue;
                }
                if graph.output_ids().contains(&id) {
                    return Err(InconsistencyError::AliasHazard(
                        "a graph output aliases destroyed storage",
                    ));
                }
                for &(client, _) in graph.clients(id) {
                    if client != destroyer
                        && live.contains(&client)
                        && !graph.is_ancestor(client, destroyer)
                    {
                        return Err(InconsistencyError::AliasHazard(
                            "destroyed storage has a consumer that may run after the destroyer",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
