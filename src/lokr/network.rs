//! The boundary to Kronecker-network backends.
//!
//! Constructing a LyCORIS-style network over a decoder is decomposition
//! math this crate does not own; it talks to backends through
//! [`NetworkFactory`] and drives whatever comes back through
//! [`KroneckerNetwork`]. Capability differences between backends surface
//! as values, not errors: see [`CapabilityOutcome`].

use std::fmt;
use std::path::Path;

use candle_core::Result;
use thiserror::Error;

use crate::lokr::config::LokrConfig;
use crate::module::AdapterTarget;

/// A constructed Kronecker-factored network, not yet necessarily active.
///
/// The lifecycle drives implementations through a fixed protocol:
/// `apply_to` grafts the network onto the module, `load_weights` fills it
/// from an artifact, `restore` undoes the graft. Implementations must make
/// `restore` valid after any successful `apply_to`, whether or not weights
/// were ever loaded.
pub trait KroneckerNetwork: Send {
    /// Backend algorithm label, for logs and debug output.
    fn algo(&self) -> &str {
        "lokr"
    }

    /// Whether this network performs DoRA-style weight decomposition.
    fn is_decomposed(&self) -> bool;

    fn multiplier(&self) -> f32;

    /// Adjust the network's output strength. Takes effect immediately on
    /// an applied network.
    fn set_multiplier(&mut self, multiplier: f32);

    /// Graft the network onto `target`, wrapping the modules it covers.
    fn apply_to(&mut self, target: &mut dyn AdapterTarget) -> Result<()>;

    /// Fill the network from the weights artifact at `path`.
    fn load_weights(&mut self, path: &Path) -> Result<()>;

    /// Undo `apply_to`, returning `target` to its unwrapped form.
    fn restore(&mut self, target: &mut dyn AdapterTarget) -> Result<()>;
}

/// Base-network construction failure. Always fatal: without a base network
/// there is nothing to fall back to.
#[derive(Debug, Error)]
#[error("failed to construct LoKr network: {0}")]
pub struct NetworkConstructionError(pub String);

/// Result of asking a backend for an optional capability.
///
/// `Unsupported` is a normal outcome, not an error: the caller degrades to
/// the base network and records why.
pub enum CapabilityOutcome {
    Supported(Box<dyn KroneckerNetwork>),
    Unsupported { reason: String },
}

impl fmt::Debug for CapabilityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityOutcome::Supported(net) => f
                .debug_struct("Supported")
                .field("algo", &net.algo())
                .finish(),
            CapabilityOutcome::Unsupported { reason } => f
                .debug_struct("Unsupported")
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Constructs Kronecker networks over a target module.
///
/// Injected into the lifecycle so deployments can swap backends, and tests
/// can script construction outcomes, without touching load logic.
pub trait NetworkFactory: Send {
    /// Construct the plain (non-decomposed) network for `config`.
    fn create(
        &self,
        target: &dyn AdapterTarget,
        config: &LokrConfig,
    ) -> std::result::Result<Box<dyn KroneckerNetwork>, NetworkConstructionError>;

    /// Attempt construction with weight decomposition enabled.
    ///
    /// Called only when the config asks for decomposition, after `create`
    /// has already succeeded.
    fn negotiate_decomposed(
        &self,
        target: &dyn AdapterTarget,
        config: &LokrConfig,
    ) -> CapabilityOutcome;
}
