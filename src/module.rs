//! The seam between the lifecycle controller and the hosted decoder module.

use std::collections::HashMap;
use std::fmt;

use candle_core::{Device, Result, Tensor};

use crate::lokr::network::KroneckerNetwork;
use crate::lora::types::StandardAdapter;
use crate::resolve::AdapterFormat;

/// Outcome of a non-strict parameter restore.
///
/// Mirrors the usual `load_state_dict(strict=False)` contract: keys the
/// module has but the source map lacks are `missing`, keys the source map
/// has but the module lacks are `unexpected`. Neither is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl KeyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// What is currently attached to a decoder, held by the decoder itself.
///
/// The binding is the source of truth for "is an adapter active"; registry
/// entries are derived bookkeeping and may lag behind.
pub enum AdapterBinding {
    Standard(StandardAdapter),
    Kronecker(Box<dyn KroneckerNetwork>),
}

impl AdapterBinding {
    pub fn format(&self) -> AdapterFormat {
        match self {
            AdapterBinding::Standard(_) => AdapterFormat::Standard,
            AdapterBinding::Kronecker(_) => AdapterFormat::Kronecker,
        }
    }
}

impl fmt::Debug for AdapterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterBinding::Standard(adapter) => f
                .debug_tuple("Standard")
                .field(&adapter.name)
                .finish(),
            AdapterBinding::Kronecker(net) => f
                .debug_struct("Kronecker")
                .field("algo", &net.algo())
                .field("decomposed", &net.is_decomposed())
                .finish(),
        }
    }
}

/// A decoder module that adapters can be attached to.
///
/// Implementations expose their trainable parameters by name, accept
/// non-strict bulk restores, and hold at most one [`AdapterBinding`].
pub trait AdapterTarget: Send {
    /// Current parameters, keyed by their canonical dotted names. The
    /// returned tensors alias module storage; callers that need a snapshot
    /// must copy them.
    fn named_parameters(&self) -> HashMap<String, Tensor>;

    /// Non-strict bulk restore. Parameters named in `params` replace the
    /// module's, key mismatches are reported rather than rejected.
    fn load_parameters(&mut self, params: &HashMap<String, Tensor>) -> Result<KeyReport>;

    /// Device the module's parameters live on.
    fn device(&self) -> &Device;

    /// Attach `binding`, replacing any previous one.
    fn bind(&mut self, binding: AdapterBinding);

    fn binding(&self) -> Option<&AdapterBinding>;

    fn binding_mut(&mut self) -> Option<&mut AdapterBinding>;

    /// Detach and return the current binding, leaving the module bare.
    fn take_binding(&mut self) -> Option<AdapterBinding>;
}
