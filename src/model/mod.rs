//! The SRCNN super-resolution model.

pub mod config;
pub mod error;
pub mod srcnn;

pub use config::{SrcnnConfig, LAST_LAYER_LR_SCALE};
pub use error::SrcnnError;
pub use srcnn::{Srcnn, StepMetrics};
