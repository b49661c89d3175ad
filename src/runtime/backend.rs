//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in the graph.")]
    NodeNotFound(NodeId),

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("No value fed for input '{0}' (node ID: {1}).")]
    MissingInput(String, NodeId),

    #[error("No value for parameter '{0}' (node ID: {1}). Initialize variables before running the graph.")]
    MissingParameter(String, NodeId),
}

/// Cache of already computed node values.
pub type Memo<T> = HashMap<NodeId, T>;

/// Common interface of an execution environment.
///
/// A backend takes an ASG plus initial values and computes the requested
/// nodes.
pub trait Backend {
    /// Device-specific representation of a value.
    type DeviceData: std::fmt::Debug + Clone;

    /// Moves host values onto the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Evaluates `outputs` and everything they depend on.
    ///
    /// `initial_memo` must hold a value for every `Input` and `Parameter`
    /// node among those dependencies. Returns the output values in request
    /// order together with the final memo.
    fn run(
        &self,
        asg: &Asg,
        outputs: &[NodeId],
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to host values.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
