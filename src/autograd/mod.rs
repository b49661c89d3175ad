//! Autograd: builds d(loss)/d(node) into the forward graph.
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order;
//!  - for every node that already has a dL/dY, emit the contributions for its
//!    operands and accumulate them (sum);
//!  - gradient nodes are appended to the same ASG, so they can read forward
//!    values directly and one session run yields loss and gradients together.
//!
//! Broadcasting is undone with `ReduceSumTo`, which reads the target shape
//! from the forward value at run time, so no static shapes are needed.
//!
//! `Select` routes the incoming gradient to the chosen branch only. Masked
//! entries therefore never multiply a NaN by zero.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Value};
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Tensors belong to different graph contexts")]
    ContextMismatch,
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Symbolic gradients of `loss` with respect to each of `params`.
///
/// Returns `None` for a parameter the loss does not depend on.
pub fn gradients(loss: &Tensor, params: &[Tensor]) -> AutogradResult<Vec<Option<Tensor>>> {
    if params.iter().any(|p| !Rc::ptr_eq(&p.context, &loss.context)) {
        return Err(AutogradError::ContextMismatch);
    }
    let wrt: Vec<NodeId> = params.iter().map(|p| p.node_id).collect();

    let grad_ids = {
        let mut ctx = loss.context.borrow_mut();
        let mut builder = Gradients::new(ctx.main_graph_mut());
        builder.build(loss.node_id, &wrt)?
    };

    Ok(grad_ids
        .into_iter()
        .map(|id| {
            id.map(|node_id| Tensor {
                node_id,
                context: Rc::clone(&loss.context),
            })
        })
        .collect())
}

/// Reverse-mode differentiation over an ASG.
pub struct Gradients<'a> {
    graph: &'a mut Asg,
    /// Forward node -> node holding dL/d(forward node).
    gmap: HashMap<NodeId, NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(graph: &'a mut Asg) -> Self {
        Self { graph, gmap: HashMap::new() }
    }

    /// Appends the gradient nodes of `loss_id` (seed = 1.0) and returns the
    /// gradient node of every id in `wrt`.
    pub fn build(&mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Vec<Option<NodeId>>> {
        self.graph.get_node(loss_id)?;
        let order = ShapeInference::topological_sort(self.graph)?;
        let seed = self.lit_scalar(1.0);
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.graph.get_node(id)?.node_type.clone();

            match node_type {
                // Leaves
                NodeType::Input { .. } | NodeType::Parameter { .. } | NodeType::Literal(_) => {}

                // -------- Binary --------
                NodeType::Add(a, b) => {
                    let ra = self.reduce_to(g_out, a);
                    self.acc(a, ra);
                    let rb = self.reduce_to(g_out, b);
                    self.acc(b, rb);
                }
                NodeType::Subtract(a, b) => {
                    let ra = self.reduce_to(g_out, a);
                    self.acc(a, ra);
                    let neg = self.add_node(NodeType::Negate(g_out));
                    let rb = self.reduce_to(neg, b);
                    self.acc(b, rb);
                }
                NodeType::Multiply(a, b) => {
                    let g_a = self.add_node(NodeType::Multiply(g_out, b));
                    let g_b = self.add_node(NodeType::Multiply(g_out, a));
                    let ra = self.reduce_to(g_a, a);
                    self.acc(a, ra);
                    let rb = self.reduce_to(g_b, b);
                    self.acc(b, rb);
                }
                NodeType::Divide(a, b) => {
                    // g_a = g / b, g_b = -g * a / b^2
                    let g_a = self.add_node(NodeType::Divide(g_out, b));
                    let b2 = self.add_node(NodeType::Multiply(b, b));
                    let num = self.add_node(NodeType::Multiply(g_out, a));
                    let quotient = self.add_node(NodeType::Divide(num, b2));
                    let g_b = self.add_node(NodeType::Negate(quotient));
                    let ra = self.reduce_to(g_a, a);
                    self.acc(a, ra);
                    let rb = self.reduce_to(g_b, b);
                    self.acc(b, rb);
                }

                // -------- Unary --------
                NodeType::Negate(x) => {
                    let g_x = self.add_node(NodeType::Negate(g_out));
                    self.acc(x, g_x);
                }
                NodeType::Sqrt(x) => {
                    // d sqrt(x) = g / (2 * sqrt(x)), sqrt(x) is this node
                    let two = self.lit_scalar(2.0);
                    let denom = self.add_node(NodeType::Multiply(two, id));
                    let g_x = self.add_node(NodeType::Divide(g_out, denom));
                    self.acc(x, g_x);
                }
                NodeType::ReLU(x) => {
                    let zero = self.lit_scalar(0.0);
                    let mask = self.add_node(NodeType::GreaterThan(x, zero));
                    let g_x = self.add_node(NodeType::Multiply(g_out, mask));
                    self.acc(x, g_x);
                }
                NodeType::Select { condition, on_true, on_false } => {
                    let zero = self.lit_scalar(0.0);
                    let g_t = self.add_node(NodeType::Select { condition, on_true: g_out, on_false: zero });
                    let g_f = self.add_node(NodeType::Select { condition, on_true: zero, on_false: g_out });
                    let rt = self.reduce_to(g_t, on_true);
                    self.acc(on_true, rt);
                    let rf = self.reduce_to(g_f, on_false);
                    self.acc(on_false, rf);
                }

                // Piecewise constant: zero derivative
                NodeType::GreaterThan(..) | NodeType::IsFinite(_) => {}

                // -------- Reductions --------
                NodeType::Sum(x) => {
                    let g_x = self.add_node(NodeType::Broadcast(g_out, x));
                    self.acc(x, g_x);
                }
                NodeType::SumAxis(x, axis) => {
                    let expanded = self.add_node(NodeType::ExpandDims(g_out, axis));
                    let g_x = self.add_node(NodeType::Broadcast(expanded, x));
                    self.acc(x, g_x);
                }

                // -------- Transformations --------
                NodeType::ExpandDims(x, axis) => {
                    let g_x = self.add_node(NodeType::SumAxis(g_out, axis));
                    self.acc(x, g_x);
                }
                NodeType::Slice { input, axis, start, length } => {
                    let g_x = self.add_node(NodeType::SliceGrad {
                        grad_output: g_out,
                        input,
                        axis,
                        start,
                        length,
                    });
                    self.acc(input, g_x);
                }
                NodeType::Concat { inputs, axis } => {
                    for (index, &input) in inputs.iter().enumerate() {
                        let g_x = self.add_node(NodeType::ConcatGrad {
                            grad_output: g_out,
                            inputs: inputs.clone(),
                            axis,
                            index,
                        });
                        self.acc(input, g_x);
                    }
                }
                NodeType::Broadcast(x, _target) => {
                    let g_x = self.add_node(NodeType::ReduceSumTo(g_out, x));
                    self.acc(x, g_x);
                }
                NodeType::ReduceSumTo(x, _target) => {
                    let g_x = self.add_node(NodeType::Broadcast(g_out, x));
                    self.acc(x, g_x);
                }

                NodeType::Conv2d { input, filter, padding } => {
                    let g_input = self.add_node(NodeType::Conv2dGradInput {
                        grad_output: g_out,
                        filter,
                        input,
                        padding,
                    });
                    self.acc(input, g_input);
                    let g_filter = self.add_node(NodeType::Conv2dGradFilter {
                        grad_output: g_out,
                        input,
                        filter,
                        padding,
                    });
                    self.acc(filter, g_filter);
                }

                // Second-order gradients are not supported
                other @ (NodeType::SliceGrad { .. }
                | NodeType::ConcatGrad { .. }
                | NodeType::Conv2dGradInput { .. }
                | NodeType::Conv2dGradFilter { .. }) => {
                    return Err(AsgError::UnsupportedOperation(format!(
                        "gradient of {}",
                        other.op_name()
                    ))
                    .into());
                }
            }
        }

        // Gradient nodes of named leaves carry a readable name.
        for (&src_id, &g_id) in self.gmap.iter() {
            let name = match &self.graph.get_node(src_id)?.node_type {
                NodeType::Parameter { name } | NodeType::Input { name } => Some(format!("grad/{}", name)),
                _ => None,
            };
            if let (Some(name), Ok(node)) = (name, self.graph.get_node_mut(g_id)) {
                if node.name.is_none() {
                    node.name = Some(name);
                }
            }
        }

        log::debug!(
            "autograd: loss node {} -> {} gradient nodes, graph now {} nodes",
            loss_id,
            self.gmap.len(),
            self.graph.nodes.len()
        );

        Ok(wrt.iter().map(|id| self.gmap.get(id).copied()).collect())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.graph.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.graph.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    /// Accumulates dL/d(target) += contrib.
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        if let Some(prev) = self.gmap.get(&target).copied() {
            let sum = self.add_node(NodeType::Add(prev, contrib));
            self.gmap.insert(target, sum);
        } else {
            self.gmap.insert(target, contrib);
        }
    }

    /// Sums `g` down to the shape of the forward node `src`.
    fn reduce_to(&mut self, g: NodeId, src: NodeId) -> NodeId {
        self.add_node(NodeType::ReduceSumTo(g, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;

    #[test]
    fn test_unreachable_parameter_has_no_gradient() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let w = Tensor::new_parameter(&context, "w");
        let unused = Tensor::new_parameter(&context, "unused");
        let loss = (&x * &w).sum();

        let grads = gradients(&loss, &[w, unused]).unwrap();
        assert!(grads[0].is_some());
        assert!(grads[1].is_none());
        assert_eq!(grads[0].as_ref().unwrap().name().as_deref(), Some("grad/w"));
    }

    #[test]
    fn test_is_finite_blocks_gradient() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&context, "w");
        let loss = w.is_finite().sum();

        let grads = gradients(&loss, &[w]).unwrap();
        assert!(grads[0].is_none());
    }

    #[test]
    fn test_context_mismatch() {
        let a = Rc::new(RefCell::new(GraphContext::new()));
        let b = Rc::new(RefCell::new(GraphContext::new()));
        let loss = Tensor::new_input(&a, "x").sum();
        let w = Tensor::new_parameter(&b, "w");

        assert!(matches!(gradients(&loss, &[w]), Err(AutogradError::ContextMismatch)));
    }
}
