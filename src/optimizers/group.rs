//! Several optimizers applied as one update.
//!
//! Each parameter group owns its optimizer (with its own learning rate and
//! slot state). `GroupedUpdate::apply` validates the gradients of every
//! group before any parameter is touched, runs the optimizers and then
//! advances a single global step counter by one.

use super::{validate_gradients, Optimizer, OptimizerError};
use crate::asg::Value;
use std::collections::{HashMap, HashSet};

pub struct ParamGroup {
    pub name: String,
    pub parameters: Vec<String>,
    pub optimizer: Box<dyn Optimizer>,
}

impl std::fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroup")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("learning_rate", &self.optimizer.learning_rate())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct GroupedUpdate {
    groups: Vec<ParamGroup>,
    members: HashSet<String>,
    global_step: u64,
}

impl GroupedUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group. A parameter may belong to one group only.
    pub fn with_group(
        mut self,
        name: &str,
        parameters: Vec<String>,
        optimizer: impl Optimizer + 'static,
    ) -> Result<Self, OptimizerError> {
        for param in &parameters {
            if !self.members.insert(param.clone()) {
                return Err(OptimizerError::DuplicateParameter(param.clone()));
            }
        }
        self.groups.push(ParamGroup {
            name: name.to_string(),
            parameters,
            optimizer: Box::new(optimizer),
        });
        Ok(self)
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Updates all groups from `gradients` and returns the new global step.
    ///
    /// Parameters without a gradient are left as they are. On error nothing
    /// is updated and the step does not advance.
    pub fn apply(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<u64, OptimizerError> {
        if let Some(name) = gradients.keys().find(|n| !self.members.contains(*n)) {
            return Err(OptimizerError::UngroupedParameter(name.clone()));
        }
        validate_gradients(parameters, gradients)?;

        for group in &mut self.groups {
            let group_grads: HashMap<String, Value> = group
                .parameters
                .iter()
                .filter_map(|p| gradients.get(p).map(|g| (p.clone(), g.clone())))
                .collect();
            log::debug!(
                "applying {} gradients to group '{}' (lr {})",
                group_grads.len(),
                group.name,
                group.optimizer.learning_rate()
            );
            group.optimizer.step(parameters, &group_grads)?;
        }

        self.global_step += 1;
        Ok(self.global_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::Adam;
    use ndarray::array;

    fn setup() -> (GroupedUpdate, HashMap<String, Value>, HashMap<String, Value>) {
        let update = GroupedUpdate::new()
            .with_group("primary", vec!["a".to_string()], Adam::new(0.1).unwrap())
            .unwrap()
            .with_group("last_layer", vec!["b".to_string()], Adam::new(0.01).unwrap())
            .unwrap();
        let params = HashMap::from([
            ("a".to_string(), Value::Tensor(array![1.0].into_dyn())),
            ("b".to_string(), Value::Tensor(array![1.0].into_dyn())),
        ]);
        let grads = HashMap::from([
            ("a".to_string(), Value::Tensor(array![1.0].into_dyn())),
            ("b".to_string(), Value::Tensor(array![1.0].into_dyn())),
        ]);
        (update, params, grads)
    }

    #[test]
    fn test_one_global_step_per_apply() {
        let (mut update, mut params, grads) = setup();
        assert_eq!(update.apply(&mut params, &grads).unwrap(), 1);
        assert_eq!(update.apply(&mut params, &grads).unwrap(), 2);
        assert_eq!(update.global_step(), 2);
    }

    #[test]
    fn test_groups_use_their_own_learning_rate() {
        let (mut update, mut params, grads) = setup();
        update.apply(&mut params, &grads).unwrap();
        let moved_a = 1.0 - params["a"].as_scalar().unwrap();
        let moved_b = 1.0 - params["b"].as_scalar().unwrap();
        assert!((moved_a - 0.1).abs() < 1e-5);
        assert!((moved_b - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_failure_is_atomic() {
        let (mut update, mut params, mut grads) = setup();
        grads.insert("b".to_string(), Value::Tensor(array![1.0, 2.0].into_dyn()));
        assert!(update.apply(&mut params, &grads).is_err());
        assert_eq!(params["a"].as_scalar(), Some(1.0));
        assert_eq!(update.global_step(), 0);

        let (mut update, mut params, mut grads) = setup();
        grads.insert("stray".to_string(), Value::Tensor(array![1.0].into_dyn()));
        assert_eq!(
            update.apply(&mut params, &grads).unwrap_err(),
            OptimizerError::UngroupedParameter("stray".to_string())
        );
    }

    #[test]
    fn test_duplicate_membership_is_rejected() {
        let err = GroupedUpdate::new()
            .with_group("g1", vec!["w".to_string()], Adam::new(0.1).unwrap())
            .unwrap()
            .with_group("g2", vec!["w".to_string()], Adam::new(0.1).unwrap())
            .unwrap_err();
        assert_eq!(err, OptimizerError::DuplicateParameter("w".to_string()));
    }
}
