//! The adapter lifecycle facade: one entry point that resolves an artifact,
//! routes it to the right loader, and keeps host flags and registry
//! bookkeeping consistent with what is actually bound.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{OptionsError, RuntimeOptions};
use crate::lokr::loader::{LokrLoadError, LokrLoader};
use crate::lokr::network::NetworkFactory;
use crate::lora::loader::{LoraLoadError, LoraLoader};
use crate::module::{AdapterBinding, AdapterTarget};
use crate::registry::{AdapterRegistry, RegistrySnapshot};
use crate::resolve::{
    self, AdapterArtifact, AdapterFormat, ADAPTER_CONFIG_FILENAME, LOKR_WEIGHTS_FILENAME,
};
use serde::Serialize;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(
        "no adapter found at {path}; expected a PEFT directory containing {config} or a LoKr \
         artifact named {lokr}",
        config = ADAPTER_CONFIG_FILENAME,
        lokr = LOKR_WEIGHTS_FILENAME
    )]
    UnresolvedFormat { path: String },

    #[error(transparent)]
    Standard(#[from] LoraLoadError),

    #[error(transparent)]
    Kronecker(#[from] LokrLoadError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("failed to detach the active adapter: {0}")]
    Detach(String),
}

/// Identity of the adapter currently presented as loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveAdapter {
    pub name: String,
    pub source: std::path::PathBuf,
    pub format: AdapterFormat,
}

/// The hosted generative model. The lifecycle only ever touches its
/// decoder; the rest of the model is none of its business.
pub struct HostedModel<M> {
    pub decoder: M,
}

/// Owns one decoder's adapter state: what is bound, whether it is in use,
/// and the registry describing what else is available.
///
/// At most one adapter is active at a time. Loading a new one first
/// detaches the old, so a load that fails mid-way leaves the host empty
/// and the decoder restored, never half-switched.
pub struct AdapterHost<M: AdapterTarget> {
    pub model: HostedModel<M>,
    pub runtime: RuntimeOptions,
    /// An adapter's weights are resident in the decoder.
    pub adapter_loaded: bool,
    /// The forward path should apply the adapter. Toggled independently of
    /// residency so callers can A/B against the base model cheaply.
    pub use_adapter: bool,
    /// Runtime strength slider; multiplies whatever the adapter baked in.
    pub adapter_scale: f32,
    active_adapter: Option<ActiveAdapter>,
    registry: AdapterRegistry,
    factory: Box<dyn NetworkFactory>,
}

impl<M: AdapterTarget> AdapterHost<M> {
    pub fn new(decoder: M, runtime: RuntimeOptions, factory: Box<dyn NetworkFactory>) -> Self {
        Self {
            model: HostedModel { decoder },
            runtime,
            adapter_loaded: false,
            use_adapter: false,
            adapter_scale: 1.0,
            active_adapter: None,
            registry: AdapterRegistry::new(),
            factory,
        }
    }

    /// Load the adapter at `path`, replacing whatever was active.
    ///
    /// The path may name a LoKr weights file, a directory holding one, or
    /// a PEFT adapter directory. On success the confirmation names the
    /// resolved artifact. A path that resolves to neither family fails
    /// without touching the current adapter.
    pub fn load_adapter(&mut self, path: impl AsRef<Path>) -> Result<String, LifecycleError> {
        let path = path.as_ref();
        let artifact = resolve::resolve(path);
        info!(path = %path.display(), format = %artifact.format, "adapter load requested");

        match artifact.format {
            AdapterFormat::Unknown => Err(LifecycleError::UnresolvedFormat {
                path: path.display().to_string(),
            }),
            AdapterFormat::Kronecker => {
                self.begin_exclusive()?;
                LokrLoader::new(self.factory.as_ref())
                    .load(&mut self.model.decoder, &artifact.path)?;
                let message = format!("✅ LoKr loaded from {}", artifact.path.display());
                self.commit(&artifact);
                Ok(message)
            }
            AdapterFormat::Standard => {
                let loader = LoraLoader::new(self.runtime.device()?, self.runtime.dtype()?);
                self.begin_exclusive()?;
                let resolved = loader.attach(&mut self.model.decoder, &artifact.path)?;
                let message = format!("✅ LoRA loaded from {}", resolved.display());
                self.commit(&artifact);
                Ok(message)
            }
        }
    }

    /// Detach the active adapter and return the decoder to its base
    /// weights. A host with nothing loaded reports that instead of
    /// failing.
    pub fn unload_adapter(&mut self) -> Result<String, LifecycleError> {
        if self.model.decoder.binding().is_none() {
            return Ok("No adapter is currently loaded".to_string());
        }
        let departing = self
            .active_adapter
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "adapter".to_string());

        self.begin_exclusive()?;
        info!(adapter = %departing, "adapter unloaded");
        Ok(format!("✅ Adapter '{departing}' unloaded"))
    }

    /// Record the runtime strength and push it into a bound Kronecker
    /// network. Standard adapters read the host field at forward time.
    pub fn set_adapter_scale(&mut self, scale: f32) {
        self.adapter_scale = scale;
        if let Some(AdapterBinding::Kronecker(net)) = self.model.decoder.binding_mut() {
            net.set_multiplier(scale);
        }
        debug!(scale = %scale, "adapter scale updated");
    }

    /// Toggle whether the forward path applies the adapter. Residency is
    /// unaffected; re-enabling is free.
    pub fn set_adapter_enabled(&mut self, enabled: bool) {
        self.use_adapter = enabled && self.adapter_loaded;
        debug!(enabled = self.use_adapter, "adapter usage toggled");
    }

    pub fn active_adapter(&self) -> Option<&ActiveAdapter> {
        self.active_adapter.as_ref()
    }

    pub fn ensure_registry(&mut self) {
        self.registry.ensure();
    }

    pub fn rebuild_registry(&mut self, root: Option<&Path>) -> (usize, Vec<String>) {
        self.registry.rebuild(root)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Detach whatever is bound and clear every flag that claims an
    /// adapter is present. Runs before any load so a failure later cannot
    /// leave stale state pointing at a detached adapter.
    fn begin_exclusive(&mut self) -> Result<(), LifecycleError> {
        let result = self.detach_binding();
        self.adapter_loaded = false;
        self.use_adapter = false;
        self.adapter_scale = 1.0;
        self.active_adapter = None;
        self.registry.clear_active();
        result
    }

    fn detach_binding(&mut self) -> Result<(), LifecycleError> {
        match self.model.decoder.take_binding() {
            None => Ok(()),
            Some(AdapterBinding::Standard(adapter)) => {
                debug!(adapter = %adapter.name, "standard adapter detached");
                Ok(())
            }
            Some(AdapterBinding::Kronecker(mut net)) => net
                .restore(&mut self.model.decoder)
                .map_err(|e| LifecycleError::Detach(e.to_string())),
        }
    }

    fn commit(&mut self, artifact: &AdapterArtifact) {
        let name = resolve::adapter_name(artifact);
        self.adapter_loaded = true;
        self.use_adapter = true;
        self.adapter_scale = 1.0;
        self.active_adapter = Some(ActiveAdapter {
            name: name.clone(),
            source: artifact.path.clone(),
            format: artifact.format,
        });

        let root = match artifact.format {
            AdapterFormat::Kronecker => artifact.path.parent().map(Path::to_path_buf),
            _ => Some(artifact.path.clone()),
        };
        self.registry.ensure();
        self.registry.rebuild(root.as_deref());
        self.registry.mark_active(&name, &artifact.path, artifact.format);
        info!(adapter = %name, format = %artifact.format, "adapter active");
    }
}
