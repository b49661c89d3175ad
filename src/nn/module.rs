//! The `Module` trait shared by all layers.

use crate::tensor::Tensor;

/// A component that adds a pattern of operations and parameters to the
/// graph.
pub trait Module {
    /// Symbolic forward pass: builds the layer's part of the graph and
    /// returns the output tensor.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters owned by this module.
    fn parameters(&self) -> Vec<Tensor>;
}
