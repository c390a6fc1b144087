use log::{info, warn};
use serde::{Deserialize, Serialize};
use tch::{Cuda, Device};

use crate::error::{Result, TrainError};

/// Where a run places its model and batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    /// First CUDA device when present, otherwise the CPU.
    Auto,
    Cpu,
    Cuda,
}

impl DeviceSelector {
    pub fn resolve(self) -> Result<Device> {
        let device = match self {
            DeviceSelector::Cpu => Device::Cpu,
            DeviceSelector::Cuda if Cuda::is_available() => Device::Cuda(0),
            DeviceSelector::Cuda => {
                return Err(TrainError::Device(
                    "cuda was requested but is not available".to_string(),
                ));
            }
            DeviceSelector::Auto => {
                let device = Device::cuda_if_available();
                if device == Device::Cpu {
                    warn!("no accelerator found, falling back to the CPU");
                }
                device
            }
        };
        info!("Using device: {:?}", device);
        Ok(device)
    }
}
