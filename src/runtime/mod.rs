//! Execution environments for the ASG.
//!
//! `backend` defines the trait, `cpu_backend` the `ndarray` interpreter,
//! `session` binds a backend to a variable store and `device` parses device
//! identifiers.

pub mod backend;
pub mod cpu_backend;
pub mod device;
pub mod session;

pub use backend::{Backend, Memo, RuntimeError};
pub use cpu_backend::CpuBackend;
pub use device::{Device, DeviceError};
pub use session::Session;
