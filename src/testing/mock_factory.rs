//! A scriptable network factory and a Kronecker network that records how
//! the lifecycle drives it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle_core::{Result, Tensor};

use crate::lokr::config::LokrConfig;
use crate::lokr::network::{
    CapabilityOutcome, KroneckerNetwork, NetworkConstructionError, NetworkFactory,
};
use crate::module::AdapterTarget;

/// Everything a [`RecordingNetwork`] was asked to do.
#[derive(Debug, Default)]
pub struct NetworkCallLog {
    pub apply_calls: usize,
    pub load_calls: usize,
    pub restore_calls: usize,
    pub loaded_from: Option<PathBuf>,
    pub multiplier: Option<f32>,
}

/// Kronecker network double. By default every operation succeeds and is
/// tallied in a shared [`NetworkCallLog`]; builder methods make individual
/// stages fail or mutate the target so rollback paths can be exercised.
pub struct RecordingNetwork {
    decomposed: bool,
    multiplier: f32,
    fail_apply: Option<String>,
    fail_load: Option<String>,
    mutate_on_apply: Option<(String, f32)>,
    applied_snapshot: Option<HashMap<String, Tensor>>,
    log: Arc<Mutex<NetworkCallLog>>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self {
            decomposed: false,
            multiplier: 1.0,
            fail_apply: None,
            fail_load: None,
            mutate_on_apply: None,
            applied_snapshot: None,
            log: Arc::new(Mutex::new(NetworkCallLog::default())),
        }
    }

    /// Present as a weight-decomposed (DoRA) network.
    pub fn decomposed(mut self) -> Self {
        self.decomposed = true;
        self
    }

    /// Fail `apply_to` with `reason`, after any configured mutation.
    pub fn failing_apply(mut self, reason: &str) -> Self {
        self.fail_apply = Some(reason.to_string());
        self
    }

    /// Fail `load_weights` with `reason`.
    pub fn failing_load(mut self, reason: &str) -> Self {
        self.fail_load = Some(reason.to_string());
        self
    }

    /// On `apply_to`, overwrite the named parameter with a constant fill,
    /// the way a real wrapper rewrites module weights in place.
    pub fn mutating_apply(mut self, parameter: &str, fill: f32) -> Self {
        self.mutate_on_apply = Some((parameter.to_string(), fill));
        self
    }

    /// Handle to the call log; grab it before boxing the network away.
    pub fn log(&self) -> Arc<Mutex<NetworkCallLog>> {
        Arc::clone(&self.log)
    }
}

impl Default for RecordingNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl KroneckerNetwork for RecordingNetwork {
    fn is_decomposed(&self) -> bool {
        self.decomposed
    }

    fn multiplier(&self) -> f32 {
        self.multiplier
    }

    fn set_multiplier(&mut self, multiplier: f32) {
        self.multiplier = multiplier;
        self.log.lock().unwrap().multiplier = Some(multiplier);
    }

    fn apply_to(&mut self, target: &mut dyn AdapterTarget) -> Result<()> {
        self.log.lock().unwrap().apply_calls += 1;

        let mut snapshot = HashMap::new();
        for (name, tensor) in target.named_parameters() {
            snapshot.insert(name, tensor.copy()?);
        }
        self.applied_snapshot = Some(snapshot);

        if let Some((name, fill)) = &self.mutate_on_apply {
            if let Some(current) = target.named_parameters().get(name) {
                let filled = Tensor::ones(current.shape(), current.dtype(), current.device())?
                    .affine(*fill as f64, 0.0)?;
                let mut update = HashMap::new();
                update.insert(name.clone(), filled);
                target.load_parameters(&update)?;
            }
        }
        if let Some(reason) = &self.fail_apply {
            return Err(candle_core::Error::Msg(reason.clone()));
        }
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.load_calls += 1;
        log.loaded_from = Some(path.to_path_buf());
        if let Some(reason) = &self.fail_load {
            return Err(candle_core::Error::Msg(reason.clone()));
        }
        Ok(())
    }

    fn restore(&mut self, target: &mut dyn AdapterTarget) -> Result<()> {
        self.log.lock().unwrap().restore_calls += 1;
        if let Some(snapshot) = self.applied_snapshot.take() {
            target.load_parameters(&snapshot)?;
        }
        Ok(())
    }
}

/// One recorded construction request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreateCall {
    /// `false` for the plain construction round, `true` for the
    /// decomposition attempt.
    pub decompose: bool,
    pub multiplier: f32,
    pub factor: i32,
}

/// What the factory should do for one construction request, in order.
pub enum ConstructionOutcome {
    Network(RecordingNetwork),
    Fail(String),
}

/// Factory that replays a fixed script of construction outcomes and
/// records every request it saw.
pub struct ScriptedFactory {
    script: Mutex<VecDeque<ConstructionOutcome>>,
    calls: Arc<Mutex<Vec<CreateCall>>>,
}

impl ScriptedFactory {
    pub fn new(script: Vec<ConstructionOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the recorded requests; grab it before handing the factory
    /// to a host.
    pub fn call_log(&self) -> Arc<Mutex<Vec<CreateCall>>> {
        Arc::clone(&self.calls)
    }

    fn next(&self) -> Option<ConstructionOutcome> {
        self.script.lock().unwrap().pop_front()
    }
}

impl NetworkFactory for ScriptedFactory {
    fn create(
        &self,
        _target: &dyn AdapterTarget,
        config: &LokrConfig,
    ) -> std::result::Result<Box<dyn KroneckerNetwork>, NetworkConstructionError> {
        self.calls.lock().unwrap().push(CreateCall {
            decompose: false,
            multiplier: config.multiplier,
            factor: config.factor,
        });
        match self.next() {
            Some(ConstructionOutcome::Network(net)) => Ok(Box::new(net)),
            Some(ConstructionOutcome::Fail(reason)) => Err(NetworkConstructionError(reason)),
            None => Err(NetworkConstructionError(
                "construction script exhausted".to_string(),
            )),
        }
    }

    fn negotiate_decomposed(
        &self,
        _target: &dyn AdapterTarget,
        config: &LokrConfig,
    ) -> CapabilityOutcome {
        self.calls.lock().unwrap().push(CreateCall {
            decompose: true,
            multiplier: config.multiplier,
            factor: config.factor,
        });
        match self.next() {
            Some(ConstructionOutcome::Network(net)) => CapabilityOutcome::Supported(Box::new(net)),
            Some(ConstructionOutcome::Fail(reason)) => CapabilityOutcome::Unsupported { reason },
            None => CapabilityOutcome::Unsupported {
                reason: "construction script exhausted".to_string(),
            },
        }
    }
}
