//! Runtime options for the adapter host: device, dtype, quantization.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("unknown device '{0}'; supported: cpu, cuda[:ordinal], metal[:ordinal]")]
    UnknownDevice(String),
    #[error("unknown dtype '{0}'; supported: auto, bf16, fp16, fp32")]
    UnknownDtype(String),
    #[error("failed to initialize device '{device}': {reason}")]
    DeviceInit { device: String, reason: String },
}

/// Host-level runtime options, typically deserialized from an application
/// config file. Adapter weights are converted to the configured device and
/// dtype as they are loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Device spec: `cpu`, `cuda`, `cuda:1`, `metal`, ...
    #[serde(default = "default_device")]
    pub device: String,
    /// Weight dtype: `auto`, `bf16`, `fp16`, `fp32`.
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Base-model quantization scheme, if any (`fp8`, `gptq`, `awq`, `bnb`,
    /// `gguf`). Carried for collaborators that must refuse capabilities
    /// under quantization; the lifecycle itself does not interpret it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_dtype() -> String {
    "auto".to_string()
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            device: default_device(),
            dtype: default_dtype(),
            quantization: None,
        }
    }
}

impl RuntimeOptions {
    /// Resolve the device spec to a live [`Device`].
    pub fn device(&self) -> Result<Device, OptionsError> {
        let spec = self.device.to_lowercase();
        let (kind, ordinal) = match spec.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal: usize = ordinal
                    .parse()
                    .map_err(|_| OptionsError::UnknownDevice(self.device.clone()))?;
                (kind, ordinal)
            }
            None => (spec.as_str(), 0),
        };
        match kind {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Device::new_cuda(ordinal).map_err(|e| OptionsError::DeviceInit {
                device: self.device.clone(),
                reason: e.to_string(),
            }),
            "metal" => Device::new_metal(ordinal).map_err(|e| OptionsError::DeviceInit {
                device: self.device.clone(),
                reason: e.to_string(),
            }),
            _ => Err(OptionsError::UnknownDevice(self.device.clone())),
        }
    }

    /// Resolve the dtype spec. `auto` selects bf16, matching what the
    /// hosted decoders ship in.
    pub fn dtype(&self) -> Result<DType, OptionsError> {
        match self.dtype.to_lowercase().as_str() {
            "auto" | "bf16" | "bfloat16" => Ok(DType::BF16),
            "fp16" | "float16" | "half" => Ok(DType::F16),
            "fp32" | "float32" | "float" => Ok(DType::F32),
            _ => Err(OptionsError::UnknownDtype(self.dtype.clone())),
        }
    }
}
