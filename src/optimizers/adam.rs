//! Adam with bias correction folded into the step size.

use super::{check_learning_rate, validate_gradients, Optimizer, OptimizerError};
use crate::asg::Value;
use ndarray::{ArrayD, Zip};
use std::collections::HashMap;

/// Adam optimizer.
///
/// Per step `t` (counted by this instance):
///
/// ```text
/// lr_t = lr * sqrt(1 - beta2^t) / (1 - beta1^t)
/// m    = beta1 * m + (1 - beta1) * g
/// v    = beta2 * v + (1 - beta2) * g^2
/// p    = p - lr_t * m / (sqrt(v) + epsilon)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub const DEFAULT_BETA1: f32 = 0.9;
    pub const DEFAULT_BETA2: f32 = 0.999;
    pub const DEFAULT_EPSILON: f32 = 1e-8;

    pub fn new(lr: f32) -> Result<Self, OptimizerError> {
        Ok(Self {
            lr: check_learning_rate(lr)?,
            beta1: Self::DEFAULT_BETA1,
            beta2: Self::DEFAULT_BETA2,
            epsilon: Self::DEFAULT_EPSILON,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        })
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Number of steps taken so far.
    pub fn iterations(&self) -> u64 {
        self.t
    }

    fn step_size(&self) -> f32 {
        let t = self.t as i32;
        self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t))
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<(), OptimizerError> {
        validate_gradients(parameters, gradients)?;

        self.t += 1;
        let lr_t = self.step_size();
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for (name, grad) in gradients {
            let Some(Value::Tensor(param)) = parameters.get_mut(name) else {
                continue;
            };
            let grad = grad.clone().into_array();
            let m = self.m.entry(name.clone()).or_default();
            if m.shape() != param.shape() {
                *m = ArrayD::zeros(param.raw_dim());
            }
            let v = self.v.entry(name.clone()).or_default();
            if v.shape() != param.shape() {
                *v = ArrayD::zeros(param.raw_dim());
            }

            Zip::from(param)
                .and(m)
                .and(v)
                .and(&grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + epsilon);
                });
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }
}
