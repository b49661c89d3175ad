//! ASG: the abstract semantic graph the model is built into.
//!
//! Nodes are allocated densely in creation order and only ever reference
//! nodes that already exist, so ascending id order is a valid evaluation order.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
}

/// Padding policy of a 2D convolution (stride is always 1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConvPadding {
    /// Zero padding so that the output keeps the input's spatial size.
    #[default]
    Same,
    /// No padding; each spatial axis shrinks by `kernel - 1`.
    Valid,
}

impl ConvPadding {
    /// Zero rows/columns added before and after an axis for `kernel`.
    pub fn pads(self, kernel: usize) -> (usize, usize) {
        match self {
            ConvPadding::Same => {
                let total = kernel.saturating_sub(1);
                (total / 2, total - total / 2)
            }
            ConvPadding::Valid => (0, 0),
        }
    }

    /// Output length of an axis of length `input`, or `None` when the kernel
    /// does not fit.
    pub fn output_len(self, input: usize, kernel: usize) -> Option<usize> {
        let (before, after) = self.pads(kernel);
        (input + before + after + 1).checked_sub(kernel).filter(|&n| n > 0)
    }
}

/// Numpy-style broadcast of two shapes, aligned on trailing axes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),

    // Binary, with broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    /// 1.0 where the operand is finite, 0.0 for NaN and +-inf.
    IsFinite(NodeId),

    /// Elementwise `condition != 0 ? on_true : on_false`.
    Select { condition: NodeId, on_true: NodeId, on_false: NodeId },

    // Reductions
    /// Sum of every element, rank 0 result.
    Sum(NodeId),
    /// Sum over one axis, the axis is removed.
    SumAxis(NodeId, usize),

    // Transformations
    ExpandDims(NodeId, usize),
    /// `length` elements of `axis` starting at `start`; a negative start
    /// counts from the end of the axis.
    Slice { input: NodeId, axis: usize, start: isize, length: usize },
    Concat { inputs: Vec<NodeId>, axis: usize },
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),

    /// NHWC input, filter `[kH, kW, C_in, C_out]`, stride 1.
    Conv2d { input: NodeId, filter: NodeId, padding: ConvPadding },

    // Backward-only nodes emitted by autograd
    SliceGrad { grad_output: NodeId, input: NodeId, axis: usize, start: isize, length: usize },
    ConcatGrad { grad_output: NodeId, inputs: Vec<NodeId>, axis: usize, index: usize },
    Conv2dGradInput { grad_output: NodeId, filter: NodeId, input: NodeId, padding: ConvPadding },
    Conv2dGradFilter { grad_output: NodeId, input: NodeId, filter: NodeId, padding: ConvPadding },
}

impl NodeType {
    /// Ids of every node this operation reads.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. } | NodeType::Parameter { .. } | NodeType::Literal(_) => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(x)
            | NodeType::Sqrt(x)
            | NodeType::ReLU(x)
            | NodeType::IsFinite(x)
            | NodeType::Sum(x)
            | NodeType::SumAxis(x, _)
            | NodeType::ExpandDims(x, _) => vec![*x],

            NodeType::Select { condition, on_true, on_false } => vec![*condition, *on_true, *on_false],
            NodeType::Slice { input, .. } => vec![*input],
            NodeType::Concat { inputs, .. } => inputs.clone(),
            NodeType::Conv2d { input, filter, .. } => vec![*input, *filter],

            NodeType::SliceGrad { grad_output, input, .. } => vec![*grad_output, *input],
            NodeType::ConcatGrad { grad_output, inputs, .. } => {
                let mut ids = vec![*grad_output];
                ids.extend(inputs.iter().copied());
                ids
            }
            NodeType::Conv2dGradInput { grad_output, filter, input, .. } => {
                vec![*grad_output, *filter, *input]
            }
            NodeType::Conv2dGradFilter { grad_output, input, filter, .. } => {
                vec![*grad_output, *input, *filter]
            }
        }
    }

    /// Short operation name used in error messages and logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Literal(_) => "Literal",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::Negate(_) => "Negate",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::ReLU(_) => "ReLU",
            NodeType::IsFinite(_) => "IsFinite",
            NodeType::Select { .. } => "Select",
            NodeType::Sum(_) => "Sum",
            NodeType::SumAxis(..) => "SumAxis",
            NodeType::ExpandDims(..) => "ExpandDims",
            NodeType::Slice { .. } => "Slice",
            NodeType::Concat { .. } => "Concat",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
            NodeType::Conv2d { .. } => "Conv2d",
            NodeType::SliceGrad { .. } => "SliceGrad",
            NodeType::ConcatGrad { .. } => "ConcatGrad",
            NodeType::Conv2dGradInput { .. } => "Conv2dGradInput",
            NodeType::Conv2dGradFilter { .. } => "Conv2dGradFilter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Views the value as an array; scalars become rank-0 arrays.
    pub fn into_array(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }

    /// The single element of a rank-0 or one-element value.
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::ScalarF32(v) => Some(*v),
            Value::Tensor(arr) if arr.len() == 1 => arr.iter().next().copied(),
            Value::Tensor(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new() }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals carry their shape from the start.
        if let NodeType::Literal(value) = &node.node_type {
            node.shape = Some(value.shape());
            node.dtype = Some(DType::F32);
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Finds the `Input` or `Parameter` node registered under `name`.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| match &n.node_type {
                NodeType::Input { name: n_name } | NodeType::Parameter { name: n_name } => n_name == name,
                _ => false,
            })
            .map(|n| n.id)
    }

    /// Every node the given roots transitively depend on, roots included.
    pub fn ancestors(&self, roots: &[NodeId]) -> AsgResult<Vec<NodeId>> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = roots.to_vec();
        let mut found = Vec::new();

        while let Some(id) = stack.pop() {
            let node = self.get_node(id)?;
            if seen.get(id).copied().unwrap_or(true) {
                continue;
            }
            seen[id] = true;
            found.push(id);
            stack.extend(node.node_type.operands());
        }

        found.sort_unstable();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_and_literals_have_shapes() {
        let mut asg = Asg::new(0, None);
        let a = asg.add_node(Some("x".into()), NodeType::Input { name: "x".into() });
        let b = asg.add_node(None, NodeType::Literal(Value::ScalarF32(2.0)));
        let c = asg.add_node(None, NodeType::Multiply(a, b));

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(asg.get_node(b).unwrap().shape, Some(vec![]));
        assert!(asg.get_node(a).unwrap().shape.is_none());
        assert_eq!(asg.find_by_name("x"), Some(a));
    }

    #[test]
    fn test_ancestors_skip_unrelated_nodes() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let y = asg.add_node(None, NodeType::Input { name: "y".into() });
        let rx = asg.add_node(None, NodeType::ReLU(x));
        let _ry = asg.add_node(None, NodeType::ReLU(y));
        let s = asg.add_node(None, NodeType::Sum(rx));

        assert_eq!(asg.ancestors(&[s]).unwrap(), vec![x, rx, s]);
        assert!(matches!(asg.ancestors(&[42]), Err(AsgError::NodeNotFound(42))));
    }

    #[test]
    fn test_conv_padding_geometry() {
        assert_eq!(ConvPadding::Same.pads(9), (4, 4));
        assert_eq!(ConvPadding::Same.pads(4), (1, 2));
        assert_eq!(ConvPadding::Same.output_len(10, 5), Some(10));
        assert_eq!(ConvPadding::Valid.output_len(10, 5), Some(6));
        assert_eq!(ConvPadding::Valid.output_len(3, 5), None);
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3, 4], &[4]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shapes(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shapes(&[2, 1], &[1, 5]), Some(vec![2, 5]));
        assert_eq!(broadcast_shapes(&[2, 3], &[4]), None);
    }
}
