use crate::analysis::ShapeInferenceError;
use crate::asg::{AsgError, Shape};
use crate::autograd::AutogradError;
use crate::ops::PaddingError;
use crate::optimizers::OptimizerError;
use crate::runtime::{DeviceError, RuntimeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SrcnnError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("The '{0}' tensor must be a graph input")]
    NotAnInput(&'static str),

    #[error("Inputs and targets belong to different graph contexts")]
    ContextMismatch,

    #[error("Expected a scalar for '{name}', got shape {shape:?}")]
    NotAScalar { name: String, shape: Shape },

    #[error("The session returned no value for '{0}'")]
    MissingOutput(&'static str),

    #[error(transparent)]
    Padding(#[from] PaddingError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Graph: {0}")]
    Asg(#[from] AsgError),

    #[error("Shape inference: {0}")]
    Shape(#[from] ShapeInferenceError),

    #[error("Autograd: {0}")]
    Autograd(#[from] AutogradError),

    #[error("Runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Optimizer: {0}")]
    Optimizer(#[from] OptimizerError),
}
