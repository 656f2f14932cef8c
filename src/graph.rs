//! The expression graph and its mutation protocol.
//!
//! A [`Graph`] is a bipartite structure of variables (values and constants)
//! and applies (an operator plus its input and output variables). The graph
//! maintains exact client and producer indices over live nodes, notifies
//! attached [`GraphListener`]s of every structural change, and exposes an
//! atomic batch-replacement API ([`Graph::replace_all_validate`]) that rolls
//! back completely when validation fails.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::downcast::DowncastDyn;
use crate::ops::kernels::OpError;
use crate::ops::{Op, TypeError};
use crate::value::{Value, ValueType};

pub mod builder;
mod listener;
mod node_id;

#[cfg(test)]
mod tests;

pub use listener::{ChangeTarget, DestroyGuard, GraphListener, ListenerId};
pub use node_id::NodeId;

/// A graph-wide invariant violation, detected either while constructing an
/// apply or while validating a replacement batch.
#[derive(Clone, Debug, PartialEq)]
pub enum InconsistencyError {
    /// The graph contains a cycle.
    Cycle,
    /// A destructive or viewing apply aliases storage unsafely.
    AliasHazard(&'static str),
    /// A node does not have the kind or type its context requires.
    TypeMismatch(&'static str),
    /// A value would be produced by more than one apply.
    DuplicateProducer(NodeId),
}

impl Display for InconsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconsistencyError::Cycle => write!(f, "graph contains a cycle"),
            InconsistencyError::AliasHazard(msg) => write!(f, "alias hazard: {}", msg),
            InconsistencyError::TypeMismatch(msg) => write!(f, "type mismatch: {}", msg),
            InconsistencyError::DuplicateProducer(id) => {
                write!(f, "node {} already has a producer", id)
            }
        }
    }
}

impl Error for InconsistencyError {}

/// Errors from adding an apply to a graph, directly or via
/// [`Graph::import_expr`].
#[derive(Clone, Debug, PartialEq)]
pub enum ImportError {
    /// Input types do not fit the operator's signature.
    Type(TypeError),
    /// The apply would violate a structural invariant.
    Inconsistency(InconsistencyError),
}

impl Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::Type(err) => write!(f, "{}", err),
            ImportError::Inconsistency(err) => write!(f, "{}", err),
        }
    }
}

impl Error for ImportError {}

impl From<TypeError> for ImportError {
    fn from(err: TypeError) -> ImportError {
        ImportError::Type(err)
    }
}

impl From<InconsistencyError> for ImportError {
    fn from(err: InconsistencyError) -> ImportError {
        ImportError::Inconsistency(err)
    }
}

/// Errors from a replacement batch. All variants leave the graph exactly as
/// it was before the batch started.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplaceError {
    /// A replacement's type is not compatible with the node it replaces.
    Type(TypeError),
    /// The rewired graph failed validation.
    Inconsistent(InconsistencyError),
    /// A node the caller required to disappear is still reachable.
    DidNotRemove(NodeId),
}

impl Display for ReplaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceError::Type(err) => write!(f, "{}", err),
            ReplaceError::Inconsistent(err) => write!(f, "{}", err),
            ReplaceError::DidNotRemove(id) => {
                write!(f, "node {} is still reachable after replacement", id)
            }
        }
    }
}

impl Error for ReplaceError {}

/// Errors from [`Graph::run`].
#[derive(Clone, Debug, PartialEq)]
pub enum RunError {
    /// The graph is not executable.
    Graph(InconsistencyError),
    /// An operator failed on concrete values.
    Op { op: String, error: OpError },
    /// No value was supplied for a required input.
    MissingInput(NodeId),
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Graph(err) => write!(f, "{}", err),
            RunError::Op { op, error } => write!(f, "error running {}: {}", op, error),
            RunError::MissingInput(id) => write!(f, "no value supplied for input {}", id),
        }
    }
}

impl Error for RunError {}

/// A runtime-computed variable.
#[derive(Clone, Debug)]
pub struct ValueNode {
    name: Option<String>,
    ty: ValueType,
    /// Provenance of this variable, accumulated across rewrites.
    trace: Vec<String>,
    /// Whether comparisons against this variable should tolerate small
    /// numeric differences (set when a rewrite reassociates arithmetic).
    tolerant: bool,
}

impl ValueNode {
    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn is_tolerant(&self) -> bool {
        self.tolerant
    }
}

/// A compile-time constant.
#[derive(Clone, Debug)]
pub struct Constant {
    name: Option<String>,
    value: Value,
}

impl Constant {
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// An operator application connecting input variables to output variables.
#[derive(Clone, Debug)]
pub struct ApplyNode {
    name: Option<String>,
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

/// A node in a [`Graph`].
#[derive(Clone, Debug)]
pub enum Node {
    Value(ValueNode),
    Constant(Constant),
    Apply(ApplyNode),
}

impl Node {
    pub fn name(&self) -> Option<&str> {
        match self {
            Node::Value(n) => n.name.as_deref(),
            Node::Constant(n) => n.name.as_deref(),
            Node::Apply(n) => n.name.as_deref(),
        }
    }

    pub fn as_apply(&self) -> Option<&ApplyNode> {
        match self {
            Node::Apply(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&ValueNode> {
        match self {
            Node::Value(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Node::Constant(n) => Some(n),
            _ => None,
        }
    }
}

enum UndoAction {
    SetInput {
        apply: NodeId,
        slot: usize,
        old: NodeId,
    },
    SetOutput {
        index: usize,
        old: NodeId,
    },
}

/// A dataflow graph of variables and operator applications.
pub struct Graph {
    // Node storage. Slots of pruned nodes are `None`.
    nodes: Vec<Option<Node>>,
    input_ids: Vec<NodeId>,
    output_ids: Vec<NodeId>,

    // Map of variable => (apply, input slot) entries reading it. Exact over
    // live nodes: every entry's apply is live and reads the variable at that
    // slot, and every such read has an entry.
    //
    // NodeIds are allocated by the graph so hashing doesn't need to be
    // DoS-resistant.
    clients: FxHashMap<NodeId, Vec<(NodeId, usize)>>,

    // Map of variable => (apply, output index) producing it.
    producers: FxHashMap<NodeId, (NodeId, usize)>,

    // Attached listeners. Slots are `None` for detached listeners and while
    // a listener is being notified.
    listeners: Vec<Option<Box<dyn GraphListener>>>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            nodes: Vec::new(),
            input_ids: Vec::new(),
            output_ids: Vec::new(),
            clients: FxHashMap::default(),
            producers: FxHashMap::default(),
            listeners: Vec::new(),
        }
    }

    fn alloc_id(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_u32(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    /// Add a runtime-computed variable.
    pub fn add_value(&mut self, name: Option<&str>, ty: ValueType) -> NodeId {
        self.alloc_id(Node::Value(ValueNode {
            name: name.map(|s| s.to_string()),
            ty,
            trace: Vec::new(),
            tolerant: false,
        }))
    }

    /// Add a constant.
    pub fn add_constant<V: Into<Value>>(&mut self, name: Option<&str>, value: V) -> NodeId {
        self.alloc_id(Node::Constant(Constant {
            name: name.map(|s| s.to_string()),
            value: value.into(),
        }))
    }

    /// Add an apply of `op` to existing variables, creating its output
    /// variables.
    ///
    /// Input types are checked against the operator's signature, and a
    /// destructive operator is refused outright if the storage it would
    /// overwrite is readable through one of its other inputs.
    pub fn add_apply(
        &mut self,
        name: Option<&str>,
        op: Op,
        inputs: &[NodeId],
    ) -> Result<NodeId, ImportError> {
        let mut input_types = Vec::with_capacity(inputs.len());
        for &input in inputs {
            let ty = self.value_type(input).ok_or(ImportError::Inconsistency(
                InconsistencyError::TypeMismatch("apply input is not a variable"),
            ))?;
            input_types.push(ty);
        }
        let output_types = op.infer_types(&input_types)?;

        if let Some((_, slot)) = op.destroy_map() {
            let root = self.storage_root(inputs[slot]);
            for (other_slot, &input) in inputs.iter().enumerate() {
                if other_slot != slot && self.storage_root(input) == root {
                    return Err(InconsistencyError::AliasHazard(
                        "an apply both reads and overwrites the same storage",
                    )
                    .into());
                }
            }
        }

        let outputs: Vec<NodeId> = output_types
            .into_iter()
            .map(|ty| self.add_value(None, ty))
            .collect();
        let apply_id = self.alloc_id(Node::Apply(ApplyNode {
            name: name.map(|s| s.to_string()),
            op,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        }));
        for (slot, &input) in inputs.iter().enumerate() {
            self.clients.entry(input).or_default().push((apply_id, slot));
        }
        for (index, &output) in outputs.iter().enumerate() {
            self.producers.insert(output, (apply_id, index));
        }

        self.notify(|listener, graph| listener.on_import(graph, apply_id));
        Ok(apply_id)
    }

    pub fn set_input_ids(&mut self, ids: &[NodeId]) {
        self.input_ids = ids.to_vec();
    }

    pub fn set_output_ids(&mut self, ids: &[NodeId]) {
        self.output_ids = ids.to_vec();
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.input_ids
    }

    pub fn output_ids(&self) -> &[NodeId] {
        &self.output_ids
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize()).and_then(|slot| slot.as_ref())
    }

    /// Return the apply node with the given ID.
    ///
    /// Panics if `id` is not a live apply.
    pub fn apply_node(&self, id: NodeId) -> &ApplyNode {
        match self.node(id) {
            Some(Node::Apply(apply)) => apply,
            _ => panic!("node {} is not a live apply", id),
        }
    }

    /// Output variables of an apply.
    pub fn apply_outputs(&self, apply: NodeId) -> &[NodeId] {
        &self.apply_node(apply).outputs
    }

    /// The static type of a variable or constant.
    pub fn value_type(&self, id: NodeId) -> Option<ValueType> {
        match self.node(id)? {
            Node::Value(value) => Some(value.ty.clone()),
            Node::Constant(constant) => Some(constant.value.value_type()),
            Node::Apply(_) => None,
        }
    }

    /// Applies reading a variable, as (apply, input slot) pairs.
    pub fn clients(&self, id: NodeId) -> &[(NodeId, usize)] {
        self.clients.get(&id).map(|list| list.as_slice()).unwrap_or(&[])
    }

    /// The apply producing a variable, with the output index, if any.
    pub fn producer(&self, id: NodeId) -> Option<(NodeId, usize)> {
        self.producers.get(&id).copied()
    }

    /// Iterate over live nodes.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|node| (NodeId::from_u32(index as u32), node))
        })
    }

    /// Number of live applies.
    pub fn apply_count(&self) -> usize {
        self.iter()
            .filter(|(_, node)| matches!(node, Node::Apply(_)))
            .count()
    }

    /// Follow view chains to the variable whose storage `id` aliases.
    pub fn storage_root(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some((apply, out_index)) = self.producer(current) {
            let apply = self.apply_node(apply);
            match apply.op.view_map() {
                Some((view_out, view_in)) if view_out == out_index => {
                    current = apply.inputs[view_in];
                }
                _ => break,
            }
        }
        current
    }

    /// True if apply `ancestor`'s outputs feed (transitively) into apply
    /// `descendant`'s inputs.
    pub fn is_ancestor(&self, ancestor: NodeId, descendant: NodeId) -> bool {
        let mut seen = FxHashSet::default();
        let mut stack = vec![descendant];
        while let Some(apply) = stack.pop() {
            if !seen.insert(apply) {
                continue;
            }
            for &input in &self.apply_node(apply).inputs {
                if let Some((producer, _)) = self.producer(input) {
                    if producer == ancestor {
                        return true;
                    }
                    stack.push(producer);
                }
            }
        }
        false
    }

    /// Applies needed to compute the graph outputs, in execution order.
    pub fn toposort(&self) -> Result<Vec<NodeId>, InconsistencyError> {
        self.toposort_from(&self.output_ids)
    }

    /// Applies needed to compute `outputs`, in execution order.
    pub fn toposort_from(&self, outputs: &[NodeId]) -> Result<Vec<NodeId>, InconsistencyError> {
        // 1 = in progress, 2 = done
        let mut state: FxHashMap<NodeId, u8> = FxHashMap::default();
        let mut order = Vec::new();
        for &output in outputs {
            let Some((root, _)) = self.producer(output) else {
                continue;
            };
            if state.get(&root) == Some(&2) {
                continue;
            }
            state.insert(root, 1);
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            while let Some(&(apply, next_input)) = stack.last() {
                let inputs = &self.apply_node(apply).inputs;
                if next_input < inputs.len() {
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    if let Some((producer, _)) = self.producer(inputs[next_input]) {
                        match state.get(&producer).copied().unwrap_or(0) {
                            0 => {
                                state.insert(producer, 1);
                                stack.push((producer, 0));
                            }
                            1 => return Err(InconsistencyError::Cycle),
                            _ => {}
                        }
                    }
                } else {
                    stack.pop();
                    state.insert(apply, 2);
                    order.push(apply);
                }
            }
        }
        Ok(order)
    }

    /// Attach a listener and fire its `on_attach` callback.
    pub fn attach_listener(&mut self, mut listener: Box<dyn GraphListener>) -> ListenerId {
        listener.on_attach(self);
        self.listeners.push(Some(listener));
        ListenerId(self.listeners.len() - 1)
    }

    /// Detach a listener, firing its `on_detach` callback, and return it.
    pub fn detach_listener(&mut self, id: ListenerId) -> Option<Box<dyn GraphListener>> {
        let mut listener = self.listeners.get_mut(id.0)?.take()?;
        listener.on_detach(self);
        Some(listener)
    }

    /// Access an attached listener's state by its concrete type.
    pub fn listener_downcast_mut<T: GraphListener>(&mut self, id: ListenerId) -> Option<&mut T> {
        self.listeners
            .get_mut(id.0)?
            .as_mut()?
            .as_mut()
            .downcast_mut::<T>()
    }

    fn notify(&mut self, f: impl Fn(&mut dyn GraphListener, &Graph)) {
        for index in 0..self.listeners.len() {
            if let Some(mut listener) = self.listeners[index].take() {
                f(listener.as_mut(), self);
                self.listeners[index] = Some(listener);
            }
        }
    }

    fn validate(&self) -> Result<(), InconsistencyError> {
        self.toposort()?;
        for listener in self.listeners.iter().flatten() {
            listener.validate(self)?;
        }
        Ok(())
    }

    /// Rewire every consumer of each `old` variable to the corresponding
    /// `new` variable, atomically.
    ///
    /// All replacements are type-checked up front. After rewiring, the graph
    /// is re-validated (acyclicity plus every attached listener's `validate`
    /// hook); if validation fails, all changes are undone and any nodes made
    /// unreachable are pruned, leaving the graph exactly as before. On
    /// success, provenance traces are copied from the replaced variables and
    /// unreachable nodes are pruned.
    pub fn replace_all_validate(
        &mut self,
        pairs: &[(NodeId, NodeId)],
        reason: &str,
    ) -> Result<(), ReplaceError> {
        self.replace_batch(pairs, None, reason)
    }

    /// As [`replace_all_validate`](Self::replace_all_validate), but
    /// additionally require that every node in `remove` is unreachable from
    /// the graph outputs afterwards. If any is still reachable the whole
    /// batch rolls back and `DidNotRemove` is returned.
    pub fn replace_all_validate_remove(
        &mut self,
        pairs: &[(NodeId, NodeId)],
        remove: &[NodeId],
        reason: &str,
    ) -> Result<(), ReplaceError> {
        self.replace_batch(pairs, Some(remove), reason)
    }

    fn replace_batch(
        &mut self,
        pairs: &[(NodeId, NodeId)],
        remove: Option<&[NodeId]>,
        reason: &str,
    ) -> Result<(), ReplaceError> {
        // Check types before touching anything.
        for &(old, new) in pairs {
            let (Some(old_ty), Some(new_ty)) = (self.value_type(old), self.value_type(new))
            else {
                return Err(ReplaceError::Inconsistent(InconsistencyError::TypeMismatch(
                    "replacement refers to a node that is not a variable",
                )));
            };
            if !old_ty.compatible(&new_ty) {
                return Err(ReplaceError::Type(TypeError::IncompatibleReplacement {
                    expected: old_ty,
                    actual: new_ty,
                }));
            }
        }

        // Snapshot the client lists the rewiring will touch. Undoing the
        // rewires restores their membership but not their ordering, so a
        // failed batch puts these lists back wholesale.
        let mut saved_clients: FxHashMap<NodeId, Vec<(NodeId, usize)>> = FxHashMap::default();
        for &(old, new) in pairs {
            for id in [old, new] {
                saved_clients
                    .entry(id)
                    .or_insert_with(|| self.clients.get(&id).cloned().unwrap_or_default());
            }
        }

        let mut undo: Vec<UndoAction> = Vec::new();
        for &(old, new) in pairs {
            if old == new {
                continue;
            }
            let clients: Vec<(NodeId, usize)> =
                self.clients.get(&old).cloned().unwrap_or_default();
            for (apply, slot) in clients {
                self.set_input(apply, slot, new);
                undo.push(UndoAction::SetInput { apply, slot, old });
                self.notify(|listener, graph| {
                    listener.on_change_input(
                        graph,
                        ChangeTarget::Apply { apply, slot },
                        old,
                        new,
                    )
                });
            }
            for index in 0..self.output_ids.len() {
                if self.output_ids[index] == old {
                    self.output_ids[index] = new;
                    undo.push(UndoAction::SetOutput { index, old });
                    self.notify(|listener, graph| {
                        listener.on_change_input(
                            graph,
                            ChangeTarget::GraphOutput { index },
                            old,
                            new,
                        )
                    });
                }
            }
        }

        let mut failure = self.validate().map_err(ReplaceError::Inconsistent);
        if failure.is_ok() {
            if let Some(remove) = remove {
                let reachable = self.reachable_set();
                if let Some(&kept) = remove.iter().find(|id| reachable.contains(id)) {
                    failure = Err(ReplaceError::DidNotRemove(kept));
                }
            }
        }

        if let Err(err) = failure {
            for action in undo.into_iter().rev() {
                match action {
                    UndoAction::SetInput { apply, slot, old } => {
                        let new = self.apply_node(apply).inputs[slot];
                        self.set_input(apply, slot, old);
                        self.notify(|listener, graph| {
                            listener.on_change_input(
                                graph,
                                ChangeTarget::Apply { apply, slot },
                                new,
                                old,
                            )
                        });
                    }
                    UndoAction::SetOutput { index, old } => {
                        let new = self.output_ids[index];
                        self.output_ids[index] = old;
                        self.notify(|listener, graph| {
                            listener.on_change_input(
                                graph,
                                ChangeTarget::GraphOutput { index },
                                new,
                                old,
                            )
                        });
                    }
                }
            }
            for (id, list) in saved_clients {
                self.clients.insert(id, list);
            }
            self.prune_unreachable();
            return Err(err);
        }

        // Commit: carry provenance over to the replacements, then drop the
        // replaced subgraphs.
        for &(old, new) in pairs {
            if old == new {
                continue;
            }
            let mut trace = match self.node(old).and_then(|node| node.as_value()) {
                Some(value) => value.trace.clone(),
                None => Vec::new(),
            };
            trace.push(reason.to_string());
            if let Some(Node::Value(value)) = self.nodes[new.as_usize()].as_mut() {
                value.trace.extend(trace);
            }
        }
        self.prune_unreachable();
        Ok(())
    }

    fn set_input(&mut self, apply: NodeId, slot: usize, new: NodeId) {
        let old = self.apply_node(apply).inputs[slot];
        if let Some(Node::Apply(node)) = self.nodes[apply.as_usize()].as_mut() {
            node.inputs[slot] = new;
        }
        if let Some(list) = self.clients.get_mut(&old) {
            if let Some(pos) = list.iter().position(|&entry| entry == (apply, slot)) {
                list.remove(pos);
            }
        }
        self.clients.entry(new).or_default().push((apply, slot));
    }

    /// Nodes reachable from the graph outputs, plus the graph inputs.
    ///
    /// During a replacement batch, applies that the batch disconnected are
    /// still present but no longer reachable; validation hooks should ignore
    /// them.
    pub fn reachable_set(&self) -> FxHashSet<NodeId> {
        let mut reachable: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack: Vec<NodeId> = Vec::new();
        stack.extend(&self.output_ids);
        stack.extend(&self.input_ids);
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some((producer, _)) = self.producer(id) {
                if reachable.insert(producer) {
                    let apply = self.apply_node(producer);
                    stack.extend(&apply.outputs);
                    stack.extend(&apply.inputs);
                }
            }
        }
        reachable
    }

    /// Drop nodes that are unreachable from the graph outputs.
    ///
    /// Graph inputs are always retained. `on_prune` fires for each dropped
    /// apply before it is removed.
    pub(crate) fn prune_unreachable(&mut self) {
        let reachable = self.reachable_set();
        let dead: Vec<NodeId> = self
            .iter()
            .map(|(id, _)| id)
            .filter(|id| !reachable.contains(id))
            .collect();

        for &id in &dead {
            if matches!(self.node(id), Some(Node::Apply(_))) {
                self.notify(|listener, graph| listener.on_prune(graph, id));
            }
        }
        for &id in &dead {
            if let Some(Node::Apply(apply)) = self.nodes[id.as_usize()].take() {
                for (slot, input) in apply.inputs.iter().enumerate() {
                    if let Some(list) = self.clients.get_mut(input) {
                        list.retain(|&entry| entry != (id, slot));
                    }
                }
                for output in &apply.outputs {
                    self.producers.remove(output);
                }
            }
            self.clients.remove(&id);
        }
    }

    /// Mark a variable's comparisons as tolerant of small numeric
    /// differences.
    pub fn mark_tolerant(&mut self, id: NodeId) {
        if let Some(Node::Value(value)) = self.nodes[id.as_usize()].as_mut() {
            value.tolerant = true;
        }
    }

    /// Execute the graph on concrete input values, returning the values of
    /// `outputs`.
    pub fn run(
        &self,
        inputs: Vec<(NodeId, Value)>,
        outputs: &[NodeId],
    ) -> Result<Vec<Value>, RunError> {
        let mut values: FxHashMap<NodeId, Value> = inputs.into_iter().collect();
        let plan = self.toposort_from(outputs).map_err(RunError::Graph)?;

        for apply_id in plan {
            let apply = self.apply_node(apply_id);
            let mut input_values = Vec::with_capacity(apply.inputs.len());
            for &input in &apply.inputs {
                let value = match values.get(&input) {
                    Some(value) => value.clone(),
                    None => match self.node(input).and_then(|node| node.as_constant()) {
                        Some(constant) => constant.value.clone(),
                        None => return Err(RunError::MissingInput(input)),
                    },
                };
                input_values.push(value);
            }
            let output_values = apply.op.perform(&input_values).map_err(|error| RunError::Op {
                op: apply.op.to_string(),
                error,
            })?;
            for (&id, value) in apply.outputs.iter().zip(output_values) {
                values.insert(id, value);
            }
        }

        outputs
            .iter()
            .map(|id| {
                values
                    .get(id)
                    .cloned()
                    .or_else(|| {
                        self.node(*id)
                            .and_then(|node| node.as_constant())
                            .map(|constant| constant.value.clone())
                    })
                    .ok_or(RunError::MissingInput(*id))
            })
            .collect()
    }
}

impl Default for Graph {
    fn default() -> Graph {
        Graph::new()
    }
}
