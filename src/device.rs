//! Compute device selection
//!
//! The training and evaluation loops only see the [`ComputeDevice`] trait.
//! Which concrete device backs it is decided once, at startup, by
//! [`select_device`].

use candle_core::{Device, Tensor};
use tracing::{info, warn};

use crate::config::{DeviceConfig, DeviceType};
use crate::error::Result;

/// Capability the loops depend on to place tensors
pub trait ComputeDevice: Send + Sync {
    /// Device on which parameters live and batches are computed
    fn device(&self) -> &Device;

    /// Stable tag recorded in checkpoints, e.g. `cpu` or `cuda:0`
    fn tag(&self) -> &str;

    /// Number of replicas the network is spread over
    fn replicas(&self) -> usize {
        1
    }

    /// Move a tensor onto the compute device
    fn place(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.to_device(self.device())?)
    }
}

/// A single CPU or accelerator device
#[derive(Debug, Clone)]
pub struct SingleDevice {
    device: Device,
    tag: String,
}

impl SingleDevice {
    /// CPU device
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            tag: "cpu".to_string(),
        }
    }

    /// Wrap an already created device
    pub fn new(device: Device, ordinal: usize) -> Self {
        let tag = if device.is_cuda() {
            format!("cuda:{ordinal}")
        } else if device.is_metal() {
            format!("metal:{ordinal}")
        } else {
            "cpu".to_string()
        };
        Self { device, tag }
    }
}

impl ComputeDevice for SingleDevice {
    fn device(&self) -> &Device {
        &self.device
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

/// Select the compute device, falling back to the CPU when the requested
/// accelerator is not available
pub fn select_device(config: &DeviceConfig) -> Result<SingleDevice> {
    let ordinal = config.ordinal;
    let device = match config.device_type {
        DeviceType::Cpu => Device::Cpu,
        DeviceType::Cuda => Device::cuda_if_available(ordinal)?,
        DeviceType::Metal => Device::metal_if_available(ordinal)?,
        DeviceType::Auto => {
            let cuda = Device::cuda_if_available(ordinal)?;
            if cuda.is_cuda() {
                cuda
            } else {
                Device::metal_if_available(ordinal)?
            }
        }
    };

    let selected = SingleDevice::new(device, ordinal);
    if selected.tag == "cpu" && matches!(config.device_type, DeviceType::Cuda | DeviceType::Metal) {
        warn!(
            "Requested {:?} device {} is not available, falling back to CPU",
            config.device_type, ordinal
        );
    }
    info!("Using compute device {}", selected.tag());
    Ok(selected)
}
