//! Adapter artifact detection: which adapter family does a path hold?

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Reserved filename for Kronecker-factored (LoKr) adapter weights.
///
/// A LoKr artifact is either a directory containing this file or the file
/// itself; no other descriptor is required.
pub const LOKR_WEIGHTS_FILENAME: &str = "lokr_weights.safetensors";

/// PEFT configuration descriptor marking a standard LoRA directory.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Preferred weights filename inside a standard LoRA directory.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Legacy PyTorch pickle weights filename inside a standard LoRA directory.
pub const ADAPTER_WEIGHTS_PICKLE_FILENAME: &str = "adapter_model.bin";

/// Adapter family detected for a filesystem path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AdapterFormat {
    /// PEFT-style low-rank adapter (directory with `adapter_config.json`).
    #[serde(rename = "lora")]
    Standard,
    /// LyCORIS-style Kronecker adapter (`lokr_weights.safetensors`).
    #[serde(rename = "lokr")]
    Kronecker,
    /// Neither marker was found.
    #[serde(rename = "unknown")]
    Unknown,
}

impl fmt::Display for AdapterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterFormat::Standard => write!(f, "lora"),
            AdapterFormat::Kronecker => write!(f, "lokr"),
            AdapterFormat::Unknown => write!(f, "unknown"),
        }
    }
}

/// A resolved reference to on-disk adapter data.
///
/// For `Kronecker` the path points at the weights file itself (directories
/// are resolved down to it); for `Standard` it is the adapter directory.
/// Artifacts are transient: they exist between resolution and load and are
/// never persisted.
#[derive(Debug, Clone)]
pub struct AdapterArtifact {
    pub path: PathBuf,
    pub format: AdapterFormat,
}

/// Locate the LoKr weights file for `path`, if there is one.
///
/// Accepts either a directory containing [`LOKR_WEIGHTS_FILENAME`] or that
/// file directly. Pure filesystem inspection; nothing is opened.
pub fn resolve_lokr_weights(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        let candidate = path.join(LOKR_WEIGHTS_FILENAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        return None;
    }
    if path.is_file() && path.file_name() == Some(OsStr::new(LOKR_WEIGHTS_FILENAME)) {
        return Some(path.to_path_buf());
    }
    None
}

/// Decide which adapter family `path` denotes.
///
/// Kronecker detection takes priority: LoKr artifacts carry no PEFT config
/// descriptor, so a directory holding both markers is treated as LoKr
/// rather than being rejected for the descriptor it does not need.
pub fn resolve(path: &Path) -> AdapterArtifact {
    if let Some(weights) = resolve_lokr_weights(path) {
        return AdapterArtifact {
            path: weights,
            format: AdapterFormat::Kronecker,
        };
    }
    if path.is_dir() && path.join(ADAPTER_CONFIG_FILENAME).is_file() {
        return AdapterArtifact {
            path: path.to_path_buf(),
            format: AdapterFormat::Standard,
        };
    }
    AdapterArtifact {
        path: path.to_path_buf(),
        format: AdapterFormat::Unknown,
    }
}

/// Derive a human-readable adapter name from a resolved artifact.
///
/// LoKr weights files take the name of the directory that holds them; other
/// artifacts use their final path component.
pub fn adapter_name(artifact: &AdapterArtifact) -> String {
    let path = &artifact.path;
    let component = if path.file_name() == Some(OsStr::new(LOKR_WEIGHTS_FILENAME)) {
        path.parent().and_then(Path::file_name)
    } else {
        path.file_name()
    };
    component
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "adapter".to_string())
}
