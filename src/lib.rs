//! Runtime lifecycle management for fine-tuning adapters on a generative
//! model's decoder.
//!
//! Two adapter families are supported: standard PEFT-style low-rank (LoRA)
//! directories and LyCORIS-style Kronecker (LoKr) weight artifacts. The
//! [`lifecycle::AdapterHost`] facade resolves which family a path holds,
//! routes it to the right loader, and keeps host flags and the adapter
//! registry consistent with what is actually bound to the decoder. LoKr
//! activation is atomic: a snapshot taken before the network wraps the
//! module guarantees a failed load rolls the decoder back to the exact
//! weights it had.

pub mod backup;
pub mod config;
pub mod lifecycle;
pub mod lokr;
pub mod lora;
pub mod module;
pub mod registry;
pub mod resolve;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
