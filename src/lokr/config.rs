//! LoKr network configuration and how it is derived for a weights artifact.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Optional JSON descriptor next to the weights file. LoKr artifacts need
/// no descriptor at all; when present it overrides everything else.
pub const LOKR_CONFIG_FILENAME: &str = "lokr_config.json";

#[derive(Debug, Error)]
pub enum LokrConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse LoKr config from {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("invalid LoKr config: {0}")]
    Invalid(String),
}

/// Hyperparameters for constructing a Kronecker-factored network.
///
/// Defaults follow the LyCORIS conventions: full-dimension rank, unit
/// multiplier and alpha, automatic factorization, decomposition off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LokrConfig {
    pub algo: String,
    pub multiplier: f32,
    pub linear_dim: usize,
    pub linear_alpha: f32,
    /// Kronecker factorization split; `-1` lets the backend choose.
    pub factor: i32,
    /// Request DoRA-style weight decomposition. Honoring it is subject to
    /// capability negotiation with the network backend.
    #[serde(alias = "dora_wd")]
    pub weight_decompose: bool,
    /// Module name fragments to wrap; empty means the backend's preset.
    pub target_modules: Vec<String>,
}

impl Default for LokrConfig {
    fn default() -> Self {
        Self {
            algo: "lokr".to_string(),
            multiplier: 1.0,
            linear_dim: 10_000,
            linear_alpha: 1.0,
            factor: -1,
            weight_decompose: false,
            target_modules: Vec::new(),
        }
    }
}

impl LokrConfig {
    /// Derive the configuration for a weights artifact.
    ///
    /// Resolution order: a [`LOKR_CONFIG_FILENAME`] sidecar next to the
    /// weights wins, then metadata embedded in the safetensors header, then
    /// defaults. Any failure to read or parse a source that is present is
    /// fatal; silently loading a misconfigured network is worse than
    /// refusing the artifact.
    pub fn for_weights(weights: &Path) -> Result<Self, LokrConfigError> {
        if let Some(dir) = weights.parent() {
            let sidecar = dir.join(LOKR_CONFIG_FILENAME);
            if sidecar.is_file() {
                debug!(path = %sidecar.display(), "reading LoKr sidecar config");
                let text = fs::read_to_string(&sidecar).map_err(|e| LokrConfigError::Io {
                    path: sidecar.display().to_string(),
                    source: e,
                })?;
                let config: Self =
                    serde_json::from_str(&text).map_err(|e| LokrConfigError::Parse {
                        path: sidecar.display().to_string(),
                        reason: e.to_string(),
                    })?;
                config.validate()?;
                return Ok(config);
            }
        }
        let config = Self::from_embedded_metadata(weights)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the `__metadata__` block of the safetensors header, falling
    /// back to defaults when the artifact carries none.
    fn from_embedded_metadata(weights: &Path) -> Result<Self, LokrConfigError> {
        let bytes = fs::read(weights).map_err(|e| LokrConfigError::Io {
            path: weights.display().to_string(),
            source: e,
        })?;
        let (_, header) =
            SafeTensors::read_metadata(&bytes).map_err(|e| LokrConfigError::Parse {
                path: weights.display().to_string(),
                reason: format!("not a valid safetensors file: {e}"),
            })?;
        match header.metadata() {
            Some(map) => Self::from_metadata_map(map).map_err(|reason| LokrConfigError::Parse {
                path: weights.display().to_string(),
                reason,
            }),
            None => Ok(Self::default()),
        }
    }

    /// Interpret the string-to-string metadata map exporters embed.
    /// Unrecognized keys are ignored; recognized keys that fail to parse
    /// are errors.
    fn from_metadata_map(map: &HashMap<String, String>) -> Result<Self, String> {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
            value
                .parse()
                .map_err(|_| format!("metadata key {key} has unusable value '{value}'"))
        }
        fn flag(key: &str, value: &str) -> Result<bool, String> {
            match value.to_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(format!("metadata key {key} has unusable value '{value}'")),
            }
        }

        let mut config = Self::default();
        if let Some(v) = map.get("algo") {
            config.algo = v.clone();
        }
        if let Some(v) = map.get("multiplier") {
            config.multiplier = number("multiplier", v)?;
        }
        if let Some(v) = map.get("linear_dim") {
            config.linear_dim = number("linear_dim", v)?;
        }
        if let Some(v) = map.get("linear_alpha") {
            config.linear_alpha = number("linear_alpha", v)?;
        }
        if let Some(v) = map.get("factor") {
            config.factor = number("factor", v)?;
        }
        for key in ["weight_decompose", "dora_wd"] {
            if let Some(v) = map.get(key) {
                config.weight_decompose = flag(key, v)?;
            }
        }
        if let Some(v) = map.get("target_modules") {
            config.target_modules = serde_json::from_str(v)
                .map_err(|_| format!("metadata key target_modules has unusable value '{v}'"))?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LokrConfigError> {
        if self.linear_dim == 0 {
            return Err(LokrConfigError::Invalid("linear_dim must be positive".into()));
        }
        if self.factor == 0 {
            return Err(LokrConfigError::Invalid(
                "factor must be -1 or a positive split".into(),
            ));
        }
        if !self.multiplier.is_finite() {
            return Err(LokrConfigError::Invalid("multiplier must be finite".into()));
        }
        Ok(())
    }
}
