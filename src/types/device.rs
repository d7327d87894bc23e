//! Device selection for runner processes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CartonError;

/// Highest GPU index a model can be placed on.
pub const MAX_GPU_INDEX: u8 = 7;

/// The device a runner is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Gpu(u8),
}

impl Device {
    /// Value for `CUDA_VISIBLE_DEVICES` in the runner's environment.
    ///
    /// An empty string hides every GPU.
    pub fn cuda_visible_devices(&self) -> String {
        match self {
            Device::Cpu => String::new(),
            Device::Gpu(idx) => idx.to_string(),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(idx) => write!(f, "gpu{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = CartonError;

    /// Accepts `cpu`, `gpuN`, `cuda:N`, or a bare index `N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "cpu" {
            return Ok(Device::Cpu);
        }
        let index = lower
            .strip_prefix("gpu")
            .or_else(|| lower.strip_prefix("cuda:"))
            .unwrap_or(&lower);
        match index.parse::<u8>() {
            Ok(idx) if idx <= MAX_GPU_INDEX => Ok(Device::Gpu(idx)),
            _ => Err(CartonError::InvalidDevice(s.to_string())),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = CartonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}
