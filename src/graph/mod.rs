//! Append-only computation graph for segmentation architectures.
//!
//! A [`GraphModel`] is a DAG of named computation nodes built through
//! explicit construction calls: [`GraphModel::add_node`] registers a node,
//! [`GraphModel::connect`] binds one node's output to an input port of
//! another. Every variant of a network is assembled into its own fresh
//! model, so a failed construction attempt can be discarded without
//! leaking state into the next attempt.
//!
//! The graph enforces its structural invariants at mutation time:
//! node names are unique, an input port accepts at most one binding, and
//! a connection that would close a cycle is rejected before it is stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Identifier of a node, dense and assigned in insertion order.
pub type NodeId = usize;
/// Index of an input slot on a node.
pub type PortId = usize;

/// Errors raised while building or ordering a graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("a node named '{0}' already exists; node names must be unique so stages can be wired unambiguously")]
    DuplicateName(String),

    #[error("the graph already declares '{0}' as its input node; a segmentation graph has exactly one input")]
    InputAlreadyDeclared(String),

    #[error("node id {0} does not exist in this graph")]
    UnknownNode(NodeId),

    #[error("port {port} is out of range for node '{node}', which accepts {arity} input(s)")]
    InvalidPort {
        node: String,
        port: PortId,
        arity: usize,
    },

    #[error("input port {port} of node '{node}' is already bound; a destination port accepts at most one connection")]
    PortAlreadyBound { node: String, port: PortId },

    #[error("node '{node}' expects {expected} operand(s) but {got} were supplied")]
    ArityMismatch {
        node: String,
        expected: usize,
        got: usize,
    },

    #[error("connecting '{src}' to '{dst}' would close a cycle; the computation graph must stay acyclic")]
    CycleDetected { src: String, dst: String },

    #[error("node '{0}' is not reachable from the declared input; every node must lie on a path from the input")]
    UnreachableNode(String),

    #[error("input port {port} of node '{node}' is unbound; every operand must be connected before the graph can be ordered")]
    UnboundPort { node: String, port: PortId },

    #[error("the graph declares no input node; add an Input node before ordering or executing the graph")]
    MissingInput,

    #[error("the graph declares no output; call set_output on the final node before validation")]
    MissingOutput,
}

/// Per-sample tensor shape in height/width/channels (NHWC) layout.
///
/// The batch dimension is implicit: shape inference reasons about a single
/// sample, and the executor carries whatever batch size the caller feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl TensorShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// True when the spatial (non-channel) dimensions match.
    pub fn same_spatial(&self, other: &TensorShape) -> bool {
        self.height == other.height && self.width == other.width
    }

    /// Number of elements in a single sample of this shape.
    pub fn elements(&self) -> usize {
        self.height * self.width * self.channels
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Elementwise activation function applied by an `Activation` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
}

/// Operation performed by a node, with its architectural parameters.
///
/// Kernel geometry is described here; kernel *values* are trainable state
/// owned by the training engine and never appear in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Entry point fed with the caller's batch.
    Input,
    /// 2D convolution. `l2` is the weight-decay factor the trainer should
    /// apply to this kernel; it does not influence validation.
    Conv {
        filters: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        l2: f32,
    },
    /// Batch normalization over the channel axis.
    Norm,
    /// Elementwise activation.
    Activation(Activation),
    /// Max pooling.
    Pool {
        kernel: (usize, usize),
        stride: (usize, usize),
    },
    /// Nearest-neighbor spatial upsampling.
    Upsample { factor: (usize, usize) },
    /// Channel-axis concatenation of two feature maps.
    Concat,
    /// Elementwise addition of two equally shaped feature maps.
    Add,
    /// Elementwise product; a single-channel operand broadcasts across
    /// the channels of the other.
    Multiply,
    /// Elementwise logistic function.
    Sigmoid,
    /// 1x1 convolution emitting one score channel per class.
    ClassifierHead { classes: usize },
}

impl NodeKind {
    /// Number of input ports this operation consumes.
    pub fn arity(&self) -> usize {
        match self {
            NodeKind::Input => 0,
            NodeKind::Concat | NodeKind::Add | NodeKind::Multiply => 2,
            _ => 1,
        }
    }

    /// Short human-readable operation name for summaries and logs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Input => "Input",
            NodeKind::Conv { .. } => "Conv",
            NodeKind::Norm => "Norm",
            NodeKind::Activation(_) => "Activation",
            NodeKind::Pool { .. } => "Pool",
            NodeKind::Upsample { .. } => "Upsample",
            NodeKind::Concat => "Concat",
            NodeKind::Add => "Add",
            NodeKind::Multiply => "Multiply",
            NodeKind::Sigmoid => "Sigmoid",
            NodeKind::ClassifierHead { .. } => "ClassifierHead",
        }
    }
}

/// Structural role of a node inside the architecture.
///
/// Roles are assigned at creation time and are the only sanctioned way for
/// later passes to locate nodes; name matching is deliberately unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The input node.
    Stem,
    /// Contracting-path nodes.
    Encoder,
    /// Expanding-path nodes.
    Decoder,
    /// Nodes belonging to an attention gate.
    Attention,
    /// The classifier head.
    Head,
}

/// One computation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Id of the node (duplicates the index for convenience in callers).
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub role: Role,
    /// Output shape, filled in by shape inference.
    pub shape: Option<TensorShape>,
}

/// A directed connection from a node's output into an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    pub dst_port: PortId,
}

/// Handle to the single output of a node, passed between builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub node: NodeId,
}

impl From<NodeId> for Port {
    fn from(node: NodeId) -> Self {
        Self { node }
    }
}

/// Append-only DAG of computation nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphModel {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    names: HashMap<String, NodeId>,
    input: Option<NodeId>,
    output: Option<NodeId>,
}

impl GraphModel {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    ///
    /// Fails with [`GraphError::DuplicateName`] if the name is taken, and
    /// with [`GraphError::InputAlreadyDeclared`] on a second `Input` node.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        role: Role,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        if matches!(kind, NodeKind::Input) {
            if let Some(existing) = self.input {
                return Err(GraphError::InputAlreadyDeclared(
                    self.nodes[existing].name.clone(),
                ));
            }
        }

        let id = self.nodes.len();
        if matches!(kind, NodeKind::Input) {
            self.input = Some(id);
        }
        self.names.insert(name.clone(), id);
        self.nodes.push(Node {
            id,
            name,
            kind,
            role,
            shape: None,
        });
        Ok(id)
    }

    /// Binds `src`'s output to input port `dst_port` of `dst`.
    ///
    /// The binding is rejected if either node is unknown, the port is out
    /// of range for the destination's arity, the port is already bound, or
    /// the edge would close a cycle (checked by walking from `dst` back
    /// towards `src` over the existing edges).
    pub fn connect(&mut self, src: Port, dst: NodeId, dst_port: PortId) -> Result<(), GraphError> {
        let src = src.node;
        if src >= self.nodes.len() {
            return Err(GraphError::UnknownNode(src));
        }
        if dst >= self.nodes.len() {
            return Err(GraphError::UnknownNode(dst));
        }

        let arity = self.nodes[dst].kind.arity();
        if dst_port >= arity {
            return Err(GraphError::InvalidPort {
                node: self.nodes[dst].name.clone(),
                port: dst_port,
                arity,
            });
        }
        if self
            .edges
            .iter()
            .any(|e| e.dst == dst && e.dst_port == dst_port)
        {
            return Err(GraphError::PortAlreadyBound {
                node: self.nodes[dst].name.clone(),
                port: dst_port,
            });
        }
        if src == dst || self.reaches(dst, src) {
            return Err(GraphError::CycleDetected {
                src: self.nodes[src].name.clone(),
                dst: self.nodes[dst].name.clone(),
            });
        }

        self.edges.push(Edge { src, dst, dst_port });
        Ok(())
    }

    /// Adds a node and connects its operands in port order in one call.
    pub fn append(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        role: Role,
        inputs: &[Port],
    ) -> Result<Port, GraphError> {
        let name = name.into();
        let expected = kind.arity();
        if inputs.len() != expected {
            return Err(GraphError::ArityMismatch {
                node: name,
                expected,
                got: inputs.len(),
            });
        }
        let id = self.add_node(name, kind, role)?;
        for (port, input) in inputs.iter().enumerate() {
            self.connect(*input, id, port)?;
        }
        Ok(Port { node: id })
    }

    /// Declares the graph's output node.
    pub fn set_output(&mut self, port: Port) -> Result<(), GraphError> {
        if port.node >= self.nodes.len() {
            return Err(GraphError::UnknownNode(port.node));
        }
        self.output = Some(port.node);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id).ok_or(GraphError::UnknownNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(id).ok_or(GraphError::UnknownNode(id))
    }

    /// Iterates nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Iterates edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// All nodes carrying the given structural role.
    pub fn nodes_with_role(&self, role: Role) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn input(&self) -> Option<NodeId> {
        self.input
    }

    pub fn output(&self) -> Result<NodeId, GraphError> {
        self.output.ok_or(GraphError::MissingOutput)
    }

    /// Operand node ids of `id`, ordered by destination port.
    ///
    /// Fails with [`GraphError::UnboundPort`] if any port is dangling.
    pub fn operands(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let node = self.node(id)?;
        let arity = node.kind.arity();
        let mut ops = vec![None; arity];
        for edge in self.edges.iter().filter(|e| e.dst == id) {
            ops[edge.dst_port] = Some(edge.src);
        }
        ops.into_iter()
            .enumerate()
            .map(|(port, src)| {
                src.ok_or_else(|| GraphError::UnboundPort {
                    node: node.name.clone(),
                    port,
                })
            })
            .collect()
    }

    /// Computation order of the graph.
    ///
    /// Checks that an input is declared, that every input port is bound,
    /// that every node is reachable from the input, and that no cycles
    /// remain, then returns a Kahn-style topological order. The order is
    /// deterministic for a given construction sequence.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let input = self.input.ok_or(GraphError::MissingInput)?;

        // Forward reachability from the input. Checked before port
        // occupancy so a node that was added and then forgotten reports
        // as unreachable rather than as a dangling port.
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![input];
        reachable[input] = true;
        while let Some(id) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.src == id) {
                if !reachable[edge.dst] {
                    reachable[edge.dst] = true;
                    stack.push(edge.dst);
                }
            }
        }
        if let Some(id) = reachable.iter().position(|r| !r) {
            return Err(GraphError::UnreachableNode(self.nodes[id].name.clone()));
        }

        for node in &self.nodes {
            let mut bound = vec![false; node.kind.arity()];
            for edge in self.edges.iter().filter(|e| e.dst == node.id) {
                bound[edge.dst_port] = true;
            }
            if let Some(port) = bound.iter().position(|b| !b) {
                return Err(GraphError::UnboundPort {
                    node: node.name.clone(),
                    port,
                });
            }
        }

        let mut indegree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            indegree[edge.dst] += 1;
        }
        let mut ready: Vec<NodeId> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.src == id) {
                indegree[edge.dst] -= 1;
                if indegree[edge.dst] == 0 {
                    ready.push(edge.dst);
                }
            }
        }
        if order.len() != self.nodes.len() {
            // connect() prevents cycles, so this guards ordering over a
            // hand-deserialized graph rather than a built one.
            let leftover = indegree.iter().position(|&d| d > 0).unwrap_or(0);
            return Err(GraphError::CycleDetected {
                src: self.nodes[leftover].name.clone(),
                dst: self.nodes[leftover].name.clone(),
            });
        }
        Ok(order)
    }

    /// True when `to` can be reached from `from` over existing edges.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        visited[from] = true;
        while let Some(id) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.src == id) {
                if edge.dst == to {
                    return true;
                }
                if !visited[edge.dst] {
                    visited[edge.dst] = true;
                    stack.push(edge.dst);
                }
            }
        }
        false
    }
}
