//! Test doubles for the adapter lifecycle: an in-memory decoder and a
//! scriptable network factory. Compiled for unit tests and behind the
//! `test-utils` feature for integration tests and downstream consumers.

mod mock_decoder;
mod mock_factory;

pub use mock_decoder::MockDecoder;
pub use mock_factory::{
    ConstructionOutcome, CreateCall, NetworkCallLog, RecordingNetwork, ScriptedFactory,
};
