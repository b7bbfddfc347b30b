//! Atomic LoKr activation: construct, snapshot, apply, fill, bind — or
//! roll the module back to the weights it had.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backup::WeightBackup;
use crate::lokr::config::{LokrConfig, LokrConfigError};
use crate::lokr::network::{CapabilityOutcome, NetworkConstructionError, NetworkFactory};
use crate::module::{AdapterBinding, AdapterTarget};

#[derive(Debug, Error)]
pub enum LokrLoadError {
    #[error(transparent)]
    Config(#[from] LokrConfigError),

    #[error(transparent)]
    Construction(#[from] NetworkConstructionError),

    #[error("failed to snapshot module weights before activation: {0}")]
    Snapshot(String),

    #[error("failed to apply LoKr network to the module: {0}")]
    Apply(String),

    #[error("failed to load LoKr weights from {path}: {reason}")]
    WeightLoad { path: String, reason: String },
}

/// Loads LoKr adapters through an injected [`NetworkFactory`].
pub struct LokrLoader<'f> {
    factory: &'f dyn NetworkFactory,
}

impl<'f> LokrLoader<'f> {
    pub fn new(factory: &'f dyn NetworkFactory) -> Self {
        Self { factory }
    }

    /// Load the artifact at `weights` onto `target`, deriving the network
    /// configuration from the artifact itself.
    pub fn load(
        &self,
        target: &mut dyn AdapterTarget,
        weights: &Path,
    ) -> Result<(), LokrLoadError> {
        let config = LokrConfig::for_weights(weights)?;
        self.load_with_config(target, weights, &config)
    }

    /// Load with an explicit configuration.
    ///
    /// Construction happens in up to two rounds. The plain network is built
    /// first and must succeed. When the config asks for weight
    /// decomposition the factory is asked a second time; a backend that
    /// cannot decompose demotes the load to the plain network instead of
    /// failing it. Whichever network wins is activated under a weight
    /// snapshot, so a failure between wrapping the module and filling the
    /// network leaves no trace.
    pub fn load_with_config(
        &self,
        target: &mut dyn AdapterTarget,
        weights: &Path,
        config: &LokrConfig,
    ) -> Result<(), LokrLoadError> {
        let base = self.factory.create(target, config)?;
        let mut network = if config.weight_decompose {
            match self.factory.negotiate_decomposed(target, config) {
                CapabilityOutcome::Supported(net) => {
                    debug!("weight decomposition supported by the network backend");
                    net
                }
                CapabilityOutcome::Unsupported { reason } => {
                    warn!(%reason, "weight decomposition unavailable, using plain LoKr network");
                    base
                }
            }
        } else {
            base
        };

        let backup = WeightBackup::capture(target)
            .map_err(|e| LokrLoadError::Snapshot(e.to_string()))?;

        if let Err(e) = network.apply_to(target) {
            roll_back(target, backup, "apply");
            return Err(LokrLoadError::Apply(e.to_string()));
        }
        if let Err(e) = network.load_weights(weights) {
            roll_back(target, backup, "weight load");
            return Err(LokrLoadError::WeightLoad {
                path: weights.display().to_string(),
                reason: e.to_string(),
            });
        }

        info!(
            algo = network.algo(),
            decomposed = network.is_decomposed(),
            multiplier = %network.multiplier(),
            path = %weights.display(),
            "LoKr network bound"
        );
        target.bind(AdapterBinding::Kronecker(network));
        Ok(())
    }
}

/// Best-effort return to the snapshot. The original failure stays primary;
/// a rollback failure is logged, not raised over it.
fn roll_back(target: &mut dyn AdapterTarget, backup: WeightBackup, stage: &str) {
    match backup.restore(target) {
        Ok(report) if report.is_clean() => debug!(stage, "module weights rolled back"),
        Ok(report) => debug!(
            stage,
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "module weights rolled back with key mismatches"
        ),
        Err(e) => error!(
            stage,
            error = %e,
            "weight rollback failed after a failed load"
        ),
    }
}
