//! Kronecker adapter family: LyCORIS-style LoKr networks.

pub mod config;
pub mod loader;
pub mod network;

pub use config::{LokrConfig, LokrConfigError, LOKR_CONFIG_FILENAME};
pub use loader::{LokrLoadError, LokrLoader};
pub use network::{CapabilityOutcome, KroneckerNetwork, NetworkConstructionError, NetworkFactory};
