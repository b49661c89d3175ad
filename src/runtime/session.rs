//! Session: runs a graph against fed inputs and a store of variable values.

use super::backend::{Backend, Memo, RuntimeError};
use super::cpu_backend::CpuBackend;
use super::device::Device;
use crate::asg::{Asg, NodeId, NodeType, Value};
use std::collections::HashMap;

/// Holds the backend, the target device and the current value of every
/// trainable parameter, keyed by parameter name.
pub struct Session<B: Backend = CpuBackend> {
    backend: B,
    device: Device,
    variables: HashMap<String, Value>,
}

impl Session<CpuBackend> {
    /// Creates a session on the CPU backend.
    ///
    /// There is no GPU backend; a GPU device is accepted and placed on the
    /// CPU.
    pub fn new(device: Device) -> Self {
        if device.is_gpu() {
            log::warn!("no GPU backend available, placing {} on the CPU", device);
        }
        Self::with_backend(CpuBackend::new(), device)
    }
}

impl<B: Backend> Session<B> {
    pub fn with_backend(backend: B, device: Device) -> Self {
        Self {
            backend,
            device,
            variables: HashMap::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Adds variables, overwriting existing ones with the same name.
    pub fn extend_variables(&mut self, values: impl IntoIterator<Item = (String, Value)>) {
        self.variables.extend(values);
    }

    /// Evaluates `fetches`.
    ///
    /// `feeds` supplies `Input` nodes by name; `Parameter` nodes read the
    /// variable store. Only the dependencies of `fetches` are computed, so
    /// unused inputs need not be fed.
    pub fn run(
        &self,
        graph: &Asg,
        fetches: &[NodeId],
        feeds: &HashMap<String, Value>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let device_feeds = self.backend.load_data(feeds)?;
        let device_vars = self.backend.load_data(&self.variables)?;

        let mut initial_memo: Memo<B::DeviceData> = HashMap::new();
        for node in graph.nodes.values() {
            let data = match &node.node_type {
                NodeType::Input { name } => device_feeds.get(name).cloned(),
                NodeType::Parameter { name } => device_vars.get(name).cloned(),
                _ => None,
            };
            if let Some(data) = data {
                initial_memo.insert(node.id, data);
            }
        }

        let (outputs, _) = self.backend.run(graph, fetches, initial_memo)?;
        self.backend.retrieve_data(&outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use ndarray::array;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_feeds_inputs_and_reads_variables() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let w = Tensor::new_parameter(&context, "w");
        let y = &x * &w;

        let mut session = Session::new(Device::Cpu(0));
        session.set_variable("w", Value::Tensor(array![2.0, 3.0].into_dyn()));
        let feeds = HashMap::from([("x".to_string(), Value::Tensor(array![1.0, -1.0].into_dyn()))]);

        let graph = context.borrow().main_graph().clone();
        let out = session.run(&graph, &[y.node_id], &feeds).unwrap();
        assert_eq!(out[0], Value::Tensor(array![2.0, -3.0].into_dyn()));
    }

    #[test]
    fn test_inputs_sharing_a_name_get_the_same_feed() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let first = Tensor::new_input(&context, "x");
        let second = Tensor::new_input(&context, "x");
        let y = &first + &second;

        let session = Session::new(Device::Cpu(0));
        let feeds = HashMap::from([("x".to_string(), Value::Tensor(array![1.5, -2.0].into_dyn()))]);
        let graph = context.borrow().main_graph().clone();
        let out = session.run(&graph, &[y.node_id], &feeds).unwrap();
        assert_eq!(out[0], Value::Tensor(array![3.0, -4.0].into_dyn()));
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&context, "w");
        let y = w.relu();

        let session = Session::new(Device::Gpu(0));
        let graph = context.borrow().main_graph().clone();
        let err = session.run(&graph, &[y.node_id], &HashMap::new()).unwrap_err();
        assert_eq!(err, RuntimeError::MissingParameter("w".to_string(), w.node_id));
        assert_eq!(session.device(), Device::Gpu(0));
    }
}
