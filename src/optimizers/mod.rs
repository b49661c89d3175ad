//! Optimizers that update parameter values.
//!
//! Optimizers work on concrete values (`Value`) on the CPU. They receive
//! the current parameters and the computed gradients, both keyed by
//! parameter name, and apply their update rule in place.

pub mod adam;
pub mod group;

pub use adam::Adam;
pub use group::{GroupedUpdate, ParamGroup};

use crate::asg::{Shape, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("Gradient given for unknown parameter '{0}'")]
    MissingParameter(String),

    #[error("Parameter '{0}' does not belong to any parameter group")]
    UngroupedParameter(String),

    #[error("Parameter '{0}' is listed in more than one parameter group")]
    DuplicateParameter(String),

    #[error("Parameter '{name}' has shape {param:?} but its gradient has shape {grad:?}")]
    ShapeMismatch { name: String, param: Shape, grad: Shape },

    #[error("Parameter '{0}' is not a tensor")]
    NotATensor(String),

    #[error("Learning rate must be positive and finite, got {0}")]
    InvalidLearningRate(f32),
}

/// Common interface of all optimizers.
pub trait Optimizer {
    /// Performs one update of every parameter named in `gradients`.
    ///
    /// Either all parameters are updated or, on error, none.
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<(), OptimizerError>;

    fn learning_rate(&self) -> f32;
}

/// Checks that every gradient has a tensor parameter of the same shape.
pub fn validate_gradients(
    parameters: &HashMap<String, Value>,
    gradients: &HashMap<String, Value>,
) -> Result<(), OptimizerError> {
    for (name, grad) in gradients {
        let param = parameters
            .get(name)
            .ok_or_else(|| OptimizerError::MissingParameter(name.clone()))?;
        let Value::Tensor(param) = param else {
            return Err(OptimizerError::NotATensor(name.clone()));
        };
        let grad_shape = grad.shape();
        if param.shape() != grad_shape.as_slice() {
            return Err(OptimizerError::ShapeMismatch {
                name: name.clone(),
                param: param.shape().to_vec(),
                grad: grad_shape,
            });
        }
    }
    Ok(())
}

pub(crate) fn check_learning_rate(lr: f32) -> Result<f32, OptimizerError> {
    if lr.is_finite() && lr > 0.0 {
        Ok(lr)
    } else {
        Err(OptimizerError::InvalidLearningRate(lr))
    }
}
