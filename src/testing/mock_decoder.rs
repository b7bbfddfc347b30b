//! An in-memory decoder with a handful of named parameters.

use std::collections::HashMap;

use candle_core::{Device, Result, Tensor};

use crate::module::{AdapterBinding, AdapterTarget, KeyReport};

/// Stand-in for a decoder module. Parameters live in a plain map; loads
/// follow the usual non-strict contract so backup and rollback behave
/// exactly as they would against a real module tree.
pub struct MockDecoder {
    device: Device,
    params: HashMap<String, Tensor>,
    binding: Option<AdapterBinding>,
}

impl MockDecoder {
    /// Two 4x4 parameters with distinct, position-dependent values, so an
    /// accidental overwrite cannot masquerade as a successful restore.
    pub fn new() -> Self {
        let device = Device::Cpu;
        let qkv = Tensor::arange(0f32, 16f32, &device)
            .unwrap()
            .reshape((4, 4))
            .unwrap();
        let fc = Tensor::arange(16f32, 32f32, &device)
            .unwrap()
            .reshape((4, 4))
            .unwrap();
        let mut params = HashMap::new();
        params.insert("blocks.0.attn.qkv.weight".to_string(), qkv);
        params.insert("blocks.0.mlp.fc.weight".to_string(), fc);
        Self {
            device,
            params,
            binding: None,
        }
    }

    pub fn with_parameters(params: HashMap<String, Tensor>) -> Self {
        Self {
            device: Device::Cpu,
            params,
            binding: None,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.params.insert(name.into(), tensor);
    }
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterTarget for MockDecoder {
    fn named_parameters(&self) -> HashMap<String, Tensor> {
        self.params.clone()
    }

    fn load_parameters(&mut self, params: &HashMap<String, Tensor>) -> Result<KeyReport> {
        let mut report = KeyReport::default();
        for (name, tensor) in params {
            match self.params.get_mut(name) {
                Some(slot) => *slot = tensor.copy()?,
                None => report.unexpected.push(name.clone()),
            }
        }
        for name in self.params.keys() {
            if !params.contains_key(name) {
                report.missing.push(name.clone());
            }
        }
        report.missing.sort_unstable();
        report.unexpected.sort_unstable();
        Ok(report)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn bind(&mut self, binding: AdapterBinding) {
        self.binding = Some(binding);
    }

    fn binding(&self) -> Option<&AdapterBinding> {
        self.binding.as_ref()
    }

    fn binding_mut(&mut self) -> Option<&mut AdapterBinding> {
        self.binding.as_mut()
    }

    fn take_binding(&mut self) -> Option<AdapterBinding> {
        self.binding.take()
    }
}
