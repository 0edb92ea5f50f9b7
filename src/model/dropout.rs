//! Seedable inverted dropout.

use std::sync::PoisonError;

use candle_core::Tensor;
use rand::Rng;

use crate::context::SharedRng;
use crate::error::Result;

/// Randomly zeroes activations during training and rescales the survivors
/// by `1 / (1 - p)`. Identity at inference or without a randomness source.
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
    rng: Option<SharedRng>,
}

impl Dropout {
    #[must_use]
    pub fn new(p: f32, rng: Option<SharedRng>) -> Self {
        Self { p, rng }
    }

    #[must_use]
    pub fn rate(&self) -> f32 {
        self.p
    }

    /// Apply dropout when `train` is set.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let Some(rng) = self.rng.as_ref() else {
            return Ok(x.clone());
        };
        if !train || self.p <= 0.0 {
            return Ok(x.clone());
        }

        let scale = 1.0 / (1.0 - self.p);
        let keep: Vec<f32> = {
            let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
            (0..x.elem_count())
                .map(|_| if rng.r#gen::<f32>() < self.p { 0.0 } else { scale })
                .collect()
        };

        let keep = Tensor::from_vec(keep, x.dims(), x.device())?.to_dtype(x.dtype())?;
        Ok(x.mul(&keep)?)
    }
}
