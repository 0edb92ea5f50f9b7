//! Execution context threaded through model construction.
//!
//! Holds the device tensors are created on and the randomness source used by
//! dropout. There is no global device or RNG state anywhere in the crate.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::model::dropout::Dropout;

/// RNG shared by every dropout site of one model.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Where dropout draws its randomness from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DropoutSource {
    /// Dropout is a no-op even in training mode.
    #[default]
    Disabled,
    /// Reproducible stream seeded once at construction.
    Seeded(u64),
    /// Seeded from OS entropy.
    Entropy,
}

/// Device plus dropout randomness for one model instance.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: Device,
    source: DropoutSource,
    rng: Option<SharedRng>,
}

impl ExecutionContext {
    /// Create a context on `device` with the given dropout source.
    #[must_use]
    pub fn new(device: Device, source: DropoutSource) -> Self {
        let rng = match source {
            DropoutSource::Disabled => None,
            DropoutSource::Seeded(seed) => Some(StdRng::seed_from_u64(seed)),
            DropoutSource::Entropy => Some(StdRng::from_entropy()),
        };
        Self {
            device,
            source,
            rng: rng.map(|r| Arc::new(Mutex::new(r))),
        }
    }

    /// Deterministic CPU context with dropout disabled.
    #[must_use]
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DropoutSource::Disabled)
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Floating point type used for all weights and activations.
    #[must_use]
    pub fn dtype(&self) -> DType {
        DType::F32
    }

    #[must_use]
    pub fn dropout_source(&self) -> DropoutSource {
        self.source
    }

    #[must_use]
    pub fn dropout_enabled(&self) -> bool {
        self.rng.is_some()
    }

    /// Build a dropout layer with rate `p` drawing from this context's RNG.
    #[must_use]
    pub fn dropout(&self, p: f32) -> Dropout {
        Dropout::new(p, self.rng.clone())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_context_has_no_rng() {
        let ctx = ExecutionContext::cpu();
        assert!(!ctx.dropout_enabled());
        assert_eq!(ctx.dropout_source(), DropoutSource::Disabled);
    }

    #[test]
    fn test_seeded_context_enables_dropout() {
        let ctx = ExecutionContext::new(Device::Cpu, DropoutSource::Seeded(7));
        assert!(ctx.dropout_enabled());
        assert_eq!(ctx.dtype(), DType::F32);
    }
}
