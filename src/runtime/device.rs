//! Target device identifiers such as `/cpu:0` or `/device:GPU:1`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Unrecognised device identifier '{0}', expected e.g. '/cpu:0' or '/gpu:0'")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu(usize),
    Gpu(usize),
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu(0)
    }
}

impl FromStr for Device {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeviceError::Invalid(s.to_string());
        let lowered = s.trim().to_ascii_lowercase();
        let name = lowered.strip_prefix('/').unwrap_or(&lowered);
        let name = name.strip_prefix("device:").unwrap_or(name);

        let (kind, index) = name.split_once(':').ok_or_else(invalid)?;
        let index: usize = index.parse().map_err(|_| invalid())?;
        match kind {
            "cpu" => Ok(Device::Cpu(index)),
            "gpu" => Ok(Device::Gpu(index)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu(i) => write!(f, "/cpu:{}", i),
            Device::Gpu(i) => write!(f, "/gpu:{}", i),
        }
    }
}
