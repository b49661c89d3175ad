//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor
//!   shapes through the graph, detecting shape mismatches before runtime.
//!   It also owns the topological sort used by autograd.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```

pub mod shape_inference;

pub use shape_inference::{ShapeInference, ShapeInferenceError};
