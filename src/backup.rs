//! Point-in-time snapshots of module weights, for rollback after a failed
//! adapter activation.

use std::collections::HashMap;

use candle_core::{Result, Tensor};
use tracing::debug;

use crate::module::{AdapterTarget, KeyReport};

/// A deep copy of every named parameter a module held at capture time.
///
/// The snapshot owns its storage: later in-place mutation of the module
/// cannot disturb it. Restoring consumes the backup, so a snapshot is
/// spent the moment it is used.
pub struct WeightBackup {
    snapshot: HashMap<String, Tensor>,
}

impl WeightBackup {
    /// Copy every parameter of `module` into fresh storage.
    pub fn capture(module: &dyn AdapterTarget) -> Result<Self> {
        let mut snapshot = HashMap::new();
        for (name, tensor) in module.named_parameters() {
            snapshot.insert(name, tensor.copy()?);
        }
        debug!(parameters = snapshot.len(), "captured weight backup");
        Ok(Self { snapshot })
    }

    /// Write the snapshot back into `module`, non-strictly.
    ///
    /// Key mismatches are informational: parameters added to the module
    /// since capture are reported as unexpected by the module and left to
    /// it, parameters it dropped come back as missing. Only tensor-level
    /// failures are errors.
    pub fn restore(self, module: &mut dyn AdapterTarget) -> Result<KeyReport> {
        let report = module.load_parameters(&self.snapshot)?;
        if !report.is_clean() {
            debug!(
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                "weight restore finished with key mismatches"
            );
        }
        Ok(report)
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDecoder;
    use candle_core::{DType, Device};

    fn tensor_values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn restore_returns_mutated_weights_to_snapshot() {
        let mut decoder = MockDecoder::new();
        let before = tensor_values(decoder.parameter("blocks.0.attn.qkv.weight").unwrap());

        let backup = WeightBackup::capture(&decoder).unwrap();
        assert_eq!(backup.len(), decoder.named_parameters().len());

        let scrambled = Tensor::ones((4, 4), DType::F32, &Device::Cpu)
            .unwrap()
            .affine(7.5, 0.0)
            .unwrap();
        decoder.set_parameter("blocks.0.attn.qkv.weight", scrambled);
        assert_ne!(
            tensor_values(decoder.parameter("blocks.0.attn.qkv.weight").unwrap()),
            before
        );

        let report = backup.restore(&mut decoder).unwrap();
        assert!(report.is_clean());
        assert_eq!(
            tensor_values(decoder.parameter("blocks.0.attn.qkv.weight").unwrap()),
            before
        );
    }

    #[test]
    fn snapshot_owns_storage_independent_of_module() {
        let mut decoder = MockDecoder::new();
        let before = tensor_values(decoder.parameter("blocks.0.mlp.fc.weight").unwrap());

        let backup = WeightBackup::capture(&decoder).unwrap();

        // Overwrite after capture; the snapshot must not see it.
        let noise = Tensor::ones((4, 4), DType::F32, &Device::Cpu)
            .unwrap()
            .affine(-3.0, 1.0)
            .unwrap();
        decoder.set_parameter("blocks.0.mlp.fc.weight", noise);

        backup.restore(&mut decoder).unwrap();
        assert_eq!(
            tensor_values(decoder.parameter("blocks.0.mlp.fc.weight").unwrap()),
            before
        );
    }

    #[test]
    fn key_mismatches_are_reported_not_fatal() {
        let mut decoder = MockDecoder::new();
        let backup = WeightBackup::capture(&decoder).unwrap();

        // A parameter that appears after capture is unexpected from the
        // snapshot's point of view; the module reports it as missing from
        // the incoming map.
        let extra = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        decoder.set_parameter("blocks.1.extra.weight", extra);

        let report = backup.restore(&mut decoder).unwrap();
        assert_eq!(report.missing, vec!["blocks.1.extra.weight".to_string()]);
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn empty_module_captures_empty_backup() {
        let decoder = MockDecoder::with_parameters(HashMap::new());
        let backup = WeightBackup::capture(&decoder).unwrap();
        assert!(backup.is_empty());
    }
}
