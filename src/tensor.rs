//! Module defining `Tensor` and `GraphContext`.
//!
//! `Tensor` is not a data container. It is a lightweight handle to a node
//! of the abstract semantic graph (ASG); every operation on it appends a new
//! node instead of computing anything. Values only exist once a
//! [`Session`](crate::runtime::session::Session) runs the graph.

use crate::asg::{Asg, ConvPadding, NodeId, NodeType, Value};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// Owns the graph while it is being built.
///
/// Shared between tensor handles through `Rc<RefCell<_>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle of a graph node.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// ID of the node this tensor stands for.
    pub node_id: NodeId,
    /// Context the node lives in.
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an input node, fed with real data at run time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();

        let node_id = graph.add_node(
            Some(name.to_string()),
            NodeType::Input {
                name: name.to_string(),
            },
        );

        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Creates a trainable parameter; its value comes from the session's
    /// variable store.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(
            Some(name.to_string()),
            NodeType::Parameter {
                name: name.to_string(),
            },
        );
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Creates a constant node holding `data`.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(
            Some(name.to_string()),
            NodeType::Literal(Value::Tensor(data)),
        );
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Creates a scalar constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::ScalarF32(value)));
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Name of the underlying node, if it has one.
    pub fn name(&self) -> Option<String> {
        self.context
            .borrow()
            .main_graph()
            .get_node(self.node_id)
            .ok()
            .and_then(|n| n.name.clone())
    }

    fn append(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self {
            node_id,
            context: Rc::clone(&self.context),
        }
    }

    // --- Elementwise ---

    pub fn square(&self) -> Self {
        self * self
    }

    pub fn sqrt(&self) -> Self {
        self.append(NodeType::Sqrt(self.node_id))
    }

    pub fn relu(&self) -> Self {
        self.append(NodeType::ReLU(self.node_id))
    }

    /// 1.0 where `self > other`, 0.0 elsewhere.
    pub fn greater_than(&self, other: &Tensor) -> Self {
        self.append(NodeType::GreaterThan(self.node_id, other.node_id))
    }

    /// 1.0 where the element is finite, 0.0 for NaN and infinities.
    pub fn is_finite(&self) -> Self {
        self.append(NodeType::IsFinite(self.node_id))
    }

    /// Picks `on_true` where `self` is non-zero and `on_false` elsewhere.
    pub fn select(&self, on_true: &Tensor, on_false: &Tensor) -> Self {
        self.append(NodeType::Select {
            condition: self.node_id,
            on_true: on_true.node_id,
            on_false: on_false.node_id,
        })
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.append(NodeType::Sum(self.node_id))
    }

    pub fn sum_axis(&self, axis: usize) -> Self {
        self.append(NodeType::SumAxis(self.node_id, axis))
    }

    // --- Transformations ---

    pub fn expand_dims(&self, axis: usize) -> Self {
        self.append(NodeType::ExpandDims(self.node_id, axis))
    }

    /// `length` entries of `axis` from `start`; `start = -1` is the last entry.
    pub fn slice(&self, axis: usize, start: isize, length: usize) -> Self {
        self.append(NodeType::Slice {
            input: self.node_id,
            axis,
            start,
            length,
        })
    }

    /// Concatenates `self` followed by `rest` along `axis`.
    pub fn concat(&self, rest: &[Tensor], axis: usize) -> Self {
        let mut inputs = vec![self.node_id];
        inputs.extend(rest.iter().map(|t| t.node_id));
        self.append(NodeType::Concat { inputs, axis })
    }

    /// NHWC convolution with stride 1 against a `[kH, kW, C_in, C_out]` filter.
    pub fn conv2d(&self, filter: &Tensor, padding: ConvPadding) -> Self {
        self.append(NodeType::Conv2d {
            input: self.node_id,
            filter: filter.node_id,
            padding,
        })
    }
}

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.append(NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.append(NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.append(NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        self.append(NodeType::Divide(self.node_id, rhs.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_append_nodes() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let w = Tensor::new_parameter(&context, "w");
        let y = &(&x * &w) + &x;

        let ctx = context.borrow();
        let graph = ctx.main_graph();
        assert_eq!(graph.get_node(x.node_id).unwrap().node_type, NodeType::Input { name: "x".to_string() });
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.get_node(y.node_id).unwrap().node_type, NodeType::Add(2, 0));
    }

    #[test]
    fn test_concat_records_every_input() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let edge = x.slice(1, -1, 1);
        let joined = x.concat(&[edge.clone(), edge.clone()], 1);

        let ctx = context.borrow();
        let node = ctx.main_graph().get_node(joined.node_id).unwrap();
        assert_eq!(
            node.node_type,
            NodeType::Concat { inputs: vec![x.node_id, edge.node_id, edge.node_id], axis: 1 }
        );
        assert_eq!(x.name().as_deref(), Some("x"));
    }
}
