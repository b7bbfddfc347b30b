//! Standard adapter family: PEFT-style low-rank (LoRA) adapters.

pub mod loader;
pub mod types;

pub use loader::{LoraLoadError, LoraLoader};
pub use types::{LoraConfig, LoraPair, StandardAdapter};
