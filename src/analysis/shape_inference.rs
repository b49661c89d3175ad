//! Module for shape and data type inference.
//!
//! Traverses the computation graph and determines the shape and data type
//! of each node from its operands' shapes and the operation type.

use crate::asg::{broadcast_shapes, Asg, AsgError, DType, Node, NodeId, NodeType, Shape};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Axis {axis} is out of range for node {node_id} of rank {rank}.")]
    AxisOutOfRange {
        node_id: NodeId,
        axis: usize,
        rank: usize,
    },

    #[error("Slice of node {node_id} starting at {start} with length {length} exceeds axis length {dim}.")]
    SliceOutOfRange {
        node_id: NodeId,
        start: isize,
        length: usize,
        dim: usize,
    },

    #[error("Convolution kernel {kernel:?} does not fit input {input:?} at node {node_id}.")]
    KernelTooLarge {
        node_id: NodeId,
        input: Shape,
        kernel: Shape,
    },

    #[error("Graph contains a cycle.")]
    CycleDetected,
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Performs shape inference for an ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs shape inference over the whole graph.
    ///
    /// Fills in the `shape` and `dtype` fields of every node in place.
    /// `initial_shapes` provides the shapes of all `Input` and `Parameter`
    /// nodes, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();

            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;

            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    /// Kahn's algorithm over operand edges.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut users: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for (&id, node) in &asg.nodes {
            in_degree.entry(id).or_insert(0);
            for operand in node.node_type.operands() {
                if !asg.nodes.contains_key(&operand) {
                    return Err(AsgError::NodeNotFound(operand).into());
                }
                *in_degree.entry(id).or_insert(0) += 1;
                users.entry(operand).or_default().push(id);
            }
        }

        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        ready.sort_unstable();
        let mut queue: VecDeque<NodeId> = ready.into();

        let mut order = Vec::with_capacity(asg.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(dependents) = users.get(&id) {
                for &user in dependents {
                    if let Some(deg) = in_degree.get_mut(&user) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(user);
                        }
                    }
                }
            }
        }

        if order.len() != asg.nodes.len() {
            return Err(ShapeInferenceError::CycleDetected);
        }
        Ok(order)
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Literal(value) => Ok((value.shape(), DType::F32)),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;
                let out = Self::broadcast(node, &ls, &rs)?;
                Ok((out, DType::F32))
            }

            NodeType::Negate(id) | NodeType::Sqrt(id) | NodeType::ReLU(id) | NodeType::IsFinite(id) => {
                Ok((Self::get_shape(asg, *id)?, DType::F32))
            }

            NodeType::Select { condition, on_true, on_false } => {
                let cs = Self::get_shape(asg, *condition)?;
                let ts = Self::get_shape(asg, *on_true)?;
                let fs = Self::get_shape(asg, *on_false)?;
                let branches = Self::broadcast(node, &ts, &fs)?;
                Ok((Self::broadcast(node, &cs, &branches)?, DType::F32))
            }

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxis(id, axis) => {
                let mut shape = Self::get_shape(asg, *id)?;
                Self::check_axis(node, *axis, shape.len())?;
                shape.remove(*axis);
                Ok((shape, DType::F32))
            }

            NodeType::ExpandDims(id, axis) => {
                let mut shape = Self::get_shape(asg, *id)?;
                Self::check_axis(node, *axis, shape.len() + 1)?;
                shape.insert(*axis, 1);
                Ok((shape, DType::F32))
            }

            NodeType::Slice { input, axis, start, length } => {
                let mut shape = Self::get_shape(asg, *input)?;
                Self::check_axis(node, *axis, shape.len())?;
                Self::check_slice(node, *start, *length, shape[*axis])?;
                shape[*axis] = *length;
                Ok((shape, DType::F32))
            }

            NodeType::Concat { inputs, axis } => {
                let mut out: Option<Shape> = None;
                for &id in inputs {
                    let shape = Self::get_shape(asg, id)?;
                    Self::check_axis(node, *axis, shape.len())?;
                    out = Some(match out {
                        None => shape,
                        Some(mut acc) => {
                            let compatible = acc.len() == shape.len()
                                && acc.iter().zip(&shape).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                            if !compatible {
                                return Err(ShapeInferenceError::IncompatibleShapes {
                                    op: "Concat".to_string(),
                                    shape1: acc,
                                    shape2: shape,
                                });
                            }
                            acc[*axis] += shape[*axis];
                            acc
                        }
                    });
                }
                let shape = out.ok_or(ShapeInferenceError::MissingShapeInfo(node.id))?;
                Ok((shape, DType::F32))
            }

            NodeType::Broadcast(_, target) | NodeType::ReduceSumTo(_, target) => {
                Ok((Self::get_shape(asg, *target)?, DType::F32))
            }

            NodeType::Conv2d { input, filter, padding } => {
                let is = Self::get_shape(asg, *input)?;
                let fs = Self::get_shape(asg, *filter)?;
                Self::check_rank(node, 4, is.len())?;
                Self::check_rank(node, 4, fs.len())?;
                if is[3] != fs[2] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Conv2d".to_string(),
                        shape1: is,
                        shape2: fs,
                    });
                }
                let too_large = || ShapeInferenceError::KernelTooLarge {
                    node_id: node.id,
                    input: is.clone(),
                    kernel: fs.clone(),
                };
                let out_h = padding.output_len(is[1], fs[0]).ok_or_else(too_large)?;
                let out_w = padding.output_len(is[2], fs[1]).ok_or_else(too_large)?;
                Ok((vec![is[0], out_h, out_w, fs[3]], DType::F32))
            }

            NodeType::SliceGrad { input, .. } | NodeType::Conv2dGradInput { input, .. } => {
                Ok((Self::get_shape(asg, *input)?, DType::F32))
            }
            NodeType::Conv2dGradFilter { filter, .. } => Ok((Self::get_shape(asg, *filter)?, DType::F32)),
            NodeType::ConcatGrad { inputs, index, .. } => {
                let id = inputs.get(*index).ok_or(ShapeInferenceError::MissingShapeInfo(node.id))?;
                Ok((Self::get_shape(asg, *id)?, DType::F32))
            }
        }
    }

    fn get_shape(asg: &Asg, node_id: NodeId) -> Result<Shape> {
        asg.get_node(node_id)?
            .shape
            .clone()
            .ok_or(ShapeInferenceError::MissingShapeInfo(node_id))
    }

    fn broadcast(node: &Node, a: &[usize], b: &[usize]) -> Result<Shape> {
        broadcast_shapes(a, b).ok_or_else(|| ShapeInferenceError::IncompatibleShapes {
            op: node.node_type.op_name().to_string(),
            shape1: a.to_vec(),
            shape2: b.to_vec(),
        })
    }

    fn check_axis(node: &Node, axis: usize, rank: usize) -> Result<()> {
        if axis >= rank {
            return Err(ShapeInferenceError::AxisOutOfRange { node_id: node.id, axis, rank });
        }
        Ok(())
    }

    fn check_rank(node: &Node, expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected, actual });
        }
        Ok(())
    }

    fn check_slice(node: &Node, start: isize, length: usize, dim: usize) -> Result<()> {
        let begin = if start < 0 { dim as isize + start } else { start };
        if begin < 0 || begin as usize + length > dim {
            return Err(ShapeInferenceError::SliceOutOfRange { node_id: node.id, start, length, dim });
        }
        Ok(())
    }
}
