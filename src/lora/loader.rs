//! Loads PEFT-style LoRA adapters from disk and attaches them to a decoder.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lora::types::{LoraConfig, LoraPair, StandardAdapter};
use crate::module::{AdapterBinding, AdapterTarget};
use crate::resolve::{
    ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME, ADAPTER_WEIGHTS_PICKLE_FILENAME,
    LOKR_WEIGHTS_FILENAME,
};

#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error(
        "no {config} found under {path}; expected a PEFT adapter directory containing {config}, \
         or a LoKr artifact named {lokr}",
        config = ADAPTER_CONFIG_FILENAME,
        lokr = LOKR_WEIGHTS_FILENAME
    )]
    ConfigNotFound { path: String },

    #[error(
        "no adapter weights under {path}; expected {preferred} or {legacy}",
        preferred = ADAPTER_WEIGHTS_FILENAME,
        legacy = ADAPTER_WEIGHTS_PICKLE_FILENAME
    )]
    WeightsNotFound { path: String },

    #[error("failed to parse {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    #[error("failed to load adapter weights from {path}: {reason}")]
    WeightsLoad { path: String, reason: String },

    #[error("mismatched low-rank pair for {module}: down {down:?} vs up {up:?}")]
    ShapeMismatch {
        module: String,
        down: Vec<usize>,
        up: Vec<usize>,
    },

    #[error("incomplete low-rank pair for module {0}")]
    IncompletePair(String),

    #[error("no low-rank weight pairs recognized under {0}")]
    EmptyAdapter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which half of a low-rank pair a weight key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairSlot {
    Down,
    Up,
}

/// Loads standard adapters onto a fixed device and dtype.
pub struct LoraLoader {
    device: Device,
    dtype: DType,
}

impl LoraLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// Load the adapter in `dir`, bind it to `target`, and return the
    /// directory it was loaded from.
    pub fn attach(
        &self,
        target: &mut dyn AdapterTarget,
        dir: &Path,
    ) -> Result<PathBuf, LoraLoadError> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "adapter".to_string());
        let adapter = self.load(dir, &name)?;
        info!(
            adapter = %adapter.name,
            modules = adapter.num_modules(),
            rank = adapter.rank,
            scale = adapter.scale,
            "standard adapter attached"
        );
        target.bind(AdapterBinding::Standard(adapter));
        Ok(dir.to_path_buf())
    }

    /// Load an adapter from `dir` without binding it anywhere.
    pub fn load(&self, dir: &Path, name: &str) -> Result<StandardAdapter, LoraLoadError> {
        let config = self.load_config(dir)?;
        if let Some(peft_type) = config.peft_type.as_deref() {
            if !peft_type.eq_ignore_ascii_case("lora") {
                warn!(peft_type, "adapter descriptor declares a non-LoRA peft type");
            }
        }
        let weights = self.load_weight_file(dir)?;
        self.build(name, dir, &config, weights)
    }

    fn load_config(&self, dir: &Path) -> Result<LoraConfig, LoraLoadError> {
        let path = dir.join(ADAPTER_CONFIG_FILENAME);
        if !path.is_file() {
            return Err(LoraLoadError::ConfigNotFound {
                path: dir.display().to_string(),
            });
        }
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(|e| LoraLoadError::ConfigParse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Read raw adapter tensors, preferring safetensors and falling back to
    /// the legacy pickle archive.
    fn load_weight_file(&self, dir: &Path) -> Result<HashMap<String, Tensor>, LoraLoadError> {
        let preferred = dir.join(ADAPTER_WEIGHTS_FILENAME);
        if preferred.is_file() {
            return candle_core::safetensors::load(&preferred, &self.device).map_err(|e| {
                LoraLoadError::WeightsLoad {
                    path: preferred.display().to_string(),
                    reason: e.to_string(),
                }
            });
        }

        let legacy = dir.join(ADAPTER_WEIGHTS_PICKLE_FILENAME);
        if legacy.is_file() {
            debug!(path = %legacy.display(), "falling back to pickled adapter weights");
            let tensors =
                candle_core::pickle::read_all(&legacy).map_err(|e| LoraLoadError::WeightsLoad {
                    path: legacy.display().to_string(),
                    reason: e.to_string(),
                })?;
            let mut map = HashMap::with_capacity(tensors.len());
            for (name, tensor) in tensors {
                let tensor =
                    tensor
                        .to_device(&self.device)
                        .map_err(|e| LoraLoadError::WeightsLoad {
                            path: legacy.display().to_string(),
                            reason: e.to_string(),
                        })?;
                map.insert(name, tensor);
            }
            return Ok(map);
        }

        Err(LoraLoadError::WeightsNotFound {
            path: dir.display().to_string(),
        })
    }

    fn build(
        &self,
        name: &str,
        dir: &Path,
        config: &LoraConfig,
        weights: HashMap<String, Tensor>,
    ) -> Result<StandardAdapter, LoraLoadError> {
        let mut halves: HashMap<String, (Option<Tensor>, Option<Tensor>)> = HashMap::new();
        let mut skipped = 0usize;

        for (key, tensor) in weights {
            let Some((module, slot)) = parse_weight_name(&key) else {
                skipped += 1;
                continue;
            };
            let tensor =
                tensor
                    .to_dtype(self.dtype)
                    .map_err(|e| LoraLoadError::WeightsLoad {
                        path: dir.display().to_string(),
                        reason: e.to_string(),
                    })?;
            let entry = halves.entry(module).or_default();
            match slot {
                PairSlot::Down => entry.0 = Some(tensor),
                PairSlot::Up => entry.1 = Some(tensor),
            }
        }
        if skipped > 0 {
            debug!(skipped, "ignored weight keys without a low-rank marker");
        }
        if halves.is_empty() {
            return Err(LoraLoadError::EmptyAdapter(dir.display().to_string()));
        }

        let mut adapter = StandardAdapter::new(name, dir.to_path_buf(), config);
        for (module, (down, up)) in halves {
            let (Some(down), Some(up)) = (down, up) else {
                return Err(LoraLoadError::IncompletePair(module));
            };
            let (down_dims, up_dims) = (down.dims().to_vec(), up.dims().to_vec());
            let ranks_agree =
                down_dims.len() == 2 && up_dims.len() == 2 && down_dims[0] == up_dims[1];
            if !ranks_agree {
                return Err(LoraLoadError::ShapeMismatch {
                    module,
                    down: down_dims,
                    up: up_dims,
                });
            }
            adapter.insert_pair(module, LoraPair { down, up });
        }
        Ok(adapter)
    }
}

/// Map a raw checkpoint key to `(module, slot)`.
///
/// Keys look like `base_model.model.<module>.lora_A.weight`; wrapper
/// prefixes and the trailing `.weight` vary between exporters, the
/// `lora_A`/`lora_B` marker (either case) is the invariant part. Keys
/// without the marker belong to other artifacts and are skipped.
fn parse_weight_name(key: &str) -> Option<(String, PairSlot)> {
    let mut name = key;
    for prefix in ["base_model.model.", "base_model.", "model."] {
        if let Some(stripped) = name.strip_prefix(prefix) {
            name = stripped;
            break;
        }
    }
    let name = name.strip_suffix(".weight").unwrap_or(name);

    for (marker, slot) in [
        (".lora_A", PairSlot::Down),
        (".lora_B", PairSlot::Up),
        (".lora_a", PairSlot::Down),
        (".lora_b", PairSlot::Up),
    ] {
        if let Some(idx) = name.rfind(marker) {
            let tail = &name[idx + marker.len()..];
            // Allow `.lora_A.default`-style adapter suffixes, nothing else.
            if tail.is_empty() || tail.starts_with('.') {
                return Some((name[..idx].to_string(), slot));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, json: &str) {
        fs::write(dir.join(ADAPTER_CONFIG_FILENAME), json).unwrap();
    }

    fn save_weights(dir: &Path, tensors: &[(&str, Tensor)]) {
        let map: HashMap<String, Tensor> = tensors
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        candle_core::safetensors::save(&map, dir.join(ADAPTER_WEIGHTS_FILENAME)).unwrap();
    }

    fn pair_tensors(rank: usize, inf: usize, outf: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let down = Tensor::ones((rank, inf), DType::F32, &device).unwrap();
        let up = Tensor::zeros((outf, rank), DType::F32, &device).unwrap();
        (down, up)
    }

    #[test]
    fn parses_standard_peft_keys() {
        let (module, slot) =
            parse_weight_name("base_model.model.blocks.0.attn.q_proj.lora_A.weight").unwrap();
        assert_eq!(module, "blocks.0.attn.q_proj");
        assert_eq!(slot, PairSlot::Down);

        let (module, slot) = parse_weight_name("blocks.0.attn.q_proj.lora_B.weight").unwrap();
        assert_eq!(module, "blocks.0.attn.q_proj");
        assert_eq!(slot, PairSlot::Up);
    }

    #[test]
    fn parses_lowercase_and_adapter_suffixed_keys() {
        let (module, slot) = parse_weight_name("model.mlp.fc1.lora_a").unwrap();
        assert_eq!(module, "mlp.fc1");
        assert_eq!(slot, PairSlot::Down);

        let (module, slot) =
            parse_weight_name("base_model.model.mlp.fc1.lora_B.default.weight").unwrap();
        assert_eq!(module, "mlp.fc1");
        assert_eq!(slot, PairSlot::Up);
    }

    #[test]
    fn rejects_keys_without_marker() {
        assert!(parse_weight_name("base_model.model.embed_tokens.weight").is_none());
        assert!(parse_weight_name("blocks.0.attn.q_proj.bias").is_none());
        assert!(parse_weight_name("blocks.0.lora_alpha").is_none());
    }

    #[test]
    fn missing_config_error_names_both_artifact_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let loader = LoraLoader::new(Device::Cpu, DType::F32);

        let err = loader.load(dir.path(), "x").unwrap_err();
        let message = err.to_string();
        assert!(message.contains(ADAPTER_CONFIG_FILENAME), "{message}");
        assert!(message.contains(LOKR_WEIGHTS_FILENAME), "{message}");
    }

    #[test]
    fn missing_weights_error_names_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"r": 4, "lora_alpha": 8}"#);
        let loader = LoraLoader::new(Device::Cpu, DType::F32);

        let err = loader.load(dir.path(), "x").unwrap_err();
        let message = err.to_string();
        assert!(message.contains(ADAPTER_WEIGHTS_FILENAME), "{message}");
        assert!(message.contains(ADAPTER_WEIGHTS_PICKLE_FILENAME), "{message}");
    }

    #[test]
    fn malformed_config_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "{not json");
        let loader = LoraLoader::new(Device::Cpu, DType::F32);

        assert!(matches!(
            loader.load(dir.path(), "x"),
            Err(LoraLoadError::ConfigParse { .. })
        ));
    }

    #[test]
    fn loads_adapter_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"{"r": 2, "lora_alpha": 4, "target_modules": ["q_proj"]}"#,
        );
        let (down, up) = pair_tensors(2, 8, 8);
        save_weights(
            dir.path(),
            &[
                ("base_model.model.blocks.0.q_proj.lora_A.weight", down),
                ("base_model.model.blocks.0.q_proj.lora_B.weight", up),
            ],
        );

        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        let adapter = loader.load(dir.path(), "unit").unwrap();

        assert_eq!(adapter.name, "unit");
        assert_eq!(adapter.rank, 2);
        assert_eq!(adapter.scale, 2.0);
        assert_eq!(adapter.num_modules(), 1);
        let pair = adapter.pair("blocks.0.q_proj").unwrap();
        assert_eq!(pair.rank(), 2);
        assert_eq!(pair.in_features(), 8);
    }

    #[test]
    fn converts_weights_to_requested_dtype() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"r": 2, "lora_alpha": 2}"#);
        let (down, up) = pair_tensors(2, 4, 4);
        save_weights(
            dir.path(),
            &[("m.lora_A.weight", down), ("m.lora_B.weight", up)],
        );

        let loader = LoraLoader::new(Device::Cpu, DType::BF16);
        let adapter = loader.load(dir.path(), "dtype").unwrap();
        let pair = adapter.pair("m").unwrap();
        assert_eq!(pair.down.dtype(), DType::BF16);
        assert_eq!(pair.up.dtype(), DType::BF16);
    }

    #[test]
    fn half_of_a_pair_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"r": 2, "lora_alpha": 2}"#);
        let (down, _) = pair_tensors(2, 4, 4);
        save_weights(dir.path(), &[("m.lora_A.weight", down)]);

        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        assert!(matches!(
            loader.load(dir.path(), "x"),
            Err(LoraLoadError::IncompletePair(m)) if m == "m"
        ));
    }

    #[test]
    fn disagreeing_ranks_are_a_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"r": 4, "lora_alpha": 4}"#);
        let device = Device::Cpu;
        let down = Tensor::zeros((4, 16), DType::F32, &device).unwrap();
        let up = Tensor::zeros((16, 8), DType::F32, &device).unwrap();
        save_weights(
            dir.path(),
            &[("m.lora_A.weight", down), ("m.lora_B.weight", up)],
        );

        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        assert!(matches!(
            loader.load(dir.path(), "x"),
            Err(LoraLoadError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn weights_with_no_recognized_pairs_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"r": 2, "lora_alpha": 2}"#);
        let noise = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        save_weights(dir.path(), &[("embed_tokens.weight", noise)]);

        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        assert!(matches!(
            loader.load(dir.path(), "x"),
            Err(LoraLoadError::EmptyAdapter(_))
        ));
    }

    #[test]
    fn attach_binds_the_loaded_adapter() {
        use crate::testing::MockDecoder;

        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"r": 2, "lora_alpha": 4}"#);
        let (down, up) = pair_tensors(2, 4, 4);
        save_weights(
            dir.path(),
            &[("m.lora_A.weight", down), ("m.lora_B.weight", up)],
        );

        let mut decoder = MockDecoder::new();
        let loader = LoraLoader::new(Device::Cpu, DType::F32);
        let resolved = loader.attach(&mut decoder, dir.path()).unwrap();

        assert_eq!(resolved, dir.path());
        match decoder.binding() {
            Some(AdapterBinding::Standard(adapter)) => {
                assert_eq!(adapter.num_modules(), 1);
                assert_eq!(adapter.source, dir.path());
            }
            other => panic!("unexpected binding: {other:?}"),
        }
    }
}
