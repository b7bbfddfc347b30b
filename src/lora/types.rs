//! PEFT adapter configuration and the in-memory standard adapter.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::Tensor;
use serde::Deserialize;

/// Parsed `adapter_config.json`, PEFT layout.
///
/// Only the fields the lifecycle consumes are modeled; everything else in
/// the descriptor is ignored on purpose.
#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    /// Nominal low-rank dimension. Individual modules may deviate when the
    /// adapter was trained with a rank pattern.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: f32,
    /// Module name fragments this adapter targets.
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub lora_dropout: f32,
    #[serde(default = "default_bias")]
    pub bias: String,
    /// Rank-stabilized scaling: divide alpha by sqrt(r) instead of r.
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub peft_type: Option<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_bias() -> String {
    "none".to_string()
}

impl LoraConfig {
    /// Effective scaling factor applied to the low-rank product.
    pub fn scaling(&self) -> f32 {
        if self.r == 0 {
            return 0.0;
        }
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }
}

/// One module's low-rank delta: a down-projection into rank space and an
/// up-projection back out.
#[derive(Debug, Clone)]
pub struct LoraPair {
    /// `lora_A`, shape `[rank, in_features]`.
    pub down: Tensor,
    /// `lora_B`, shape `[out_features, rank]`.
    pub up: Tensor,
}

impl LoraPair {
    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    pub fn in_features(&self) -> usize {
        self.down.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.up.dims()[0]
    }
}

/// A fully loaded standard (PEFT LoRA) adapter, ready to bind to a decoder.
#[derive(Debug)]
pub struct StandardAdapter {
    pub name: String,
    /// Directory the adapter was loaded from.
    pub source: PathBuf,
    pub rank: usize,
    pub alpha: f32,
    /// Scaling baked from the config; runtime sliders multiply on top.
    pub scale: f32,
    pub target_modules: Vec<String>,
    pairs: HashMap<String, LoraPair>,
}

impl StandardAdapter {
    pub fn new(name: impl Into<String>, source: PathBuf, config: &LoraConfig) -> Self {
        Self {
            name: name.into(),
            source,
            rank: config.r,
            alpha: config.lora_alpha,
            scale: config.scaling(),
            target_modules: config.target_modules.clone(),
            pairs: HashMap::new(),
        }
    }

    pub fn insert_pair(&mut self, module: impl Into<String>, pair: LoraPair) {
        self.pairs.insert(module.into(), pair);
    }

    pub fn pair(&self, module: &str) -> Option<&LoraPair> {
        self.pairs.get(module)
    }

    pub fn num_modules(&self) -> usize {
        self.pairs.len()
    }

    /// Module names covered by this adapter, sorted for stable output.
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pairs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn stub(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: PathBuf::new(),
            rank: 4,
            alpha: 8.0,
            scale: 2.0,
            target_modules: Vec::new(),
            pairs: HashMap::new(),
        }
    }
}
