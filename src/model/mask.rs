//! Boolean attention masks.
//!
//! `true` at `(i, j)` means query `i` may NOT attend to key `j`. Masks are
//! stored as `u8` tensors of shape `[L, L]` (shared by the batch) or
//! `[B, L, L]` (per batch element) and are turned into `-inf` scores right
//! before the softmax.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TransformerError};

/// Dtype of the stored mask tensors.
pub const MASK_DTYPE: DType = DType::U8;

#[derive(Debug, Clone)]
pub struct AttentionMask {
    blocked: Tensor,
    seq_len: usize,
    batch: Option<usize>,
}

impl AttentionMask {
    /// Strictly upper-triangular mask: position `i` sees keys `0..=i`.
    ///
    /// # Errors
    /// Returns an error for an empty sequence or if tensor creation fails.
    pub fn causal(seq_len: usize, device: &Device) -> Result<Self> {
        ensure_non_empty(seq_len)?;
        let data: Vec<u8> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| u8::from(j > i)))
            .collect();
        let blocked = Tensor::from_vec(data, (seq_len, seq_len), device)?;
        Ok(Self {
            blocked,
            seq_len,
            batch: None,
        })
    }

    /// Build a `[L, L]` mask from explicit rows.
    ///
    /// # Errors
    /// Returns [`TransformerError::InvalidMask`] if the rows are not square or
    /// any row blocks every key.
    pub fn from_rows(rows: &[Vec<bool>], device: &Device) -> Result<Self> {
        let seq_len = rows.len();
        ensure_non_empty(seq_len)?;
        for (i, row) in rows.iter().enumerate() {
            if row.len() != seq_len {
                return Err(TransformerError::InvalidMask(format!(
                    "row {i} has {} entries, expected {seq_len}",
                    row.len()
                )));
            }
            if row.iter().all(|b| *b) {
                return Err(TransformerError::InvalidMask(format!(
                    "row {i} blocks every key"
                )));
            }
        }
        let data: Vec<u8> = rows.iter().flatten().map(|b| u8::from(*b)).collect();
        let blocked = Tensor::from_vec(data, (seq_len, seq_len), device)?;
        Ok(Self {
            blocked,
            seq_len,
            batch: None,
        })
    }

    /// Per-batch mask hiding padded keys from every query.
    ///
    /// `padding[b][j]` is `true` when key `j` of batch element `b` is padding.
    ///
    /// # Errors
    /// Returns [`TransformerError::InvalidMask`] if lengths differ or a batch
    /// element is entirely padding.
    pub fn key_padding(padding: &[Vec<bool>], device: &Device) -> Result<Self> {
        let Some(first) = padding.first() else {
            return Err(TransformerError::InvalidMask(
                "padding mask needs at least one batch element".to_string(),
            ));
        };
        let seq_len = first.len();
        ensure_non_empty(seq_len)?;

        let mut data = Vec::with_capacity(padding.len() * seq_len * seq_len);
        for (b, keys) in padding.iter().enumerate() {
            if keys.len() != seq_len {
                return Err(TransformerError::InvalidMask(format!(
                    "batch element {b} has {} keys, expected {seq_len}",
                    keys.len()
                )));
            }
            if keys.iter().all(|p| *p) {
                return Err(TransformerError::InvalidMask(format!(
                    "batch element {b} is entirely padding"
                )));
            }
            for _ in 0..seq_len {
                data.extend(keys.iter().map(|p| u8::from(*p)));
            }
        }

        let batch = padding.len();
        let blocked = Tensor::from_vec(data, (batch, seq_len, seq_len), device)?;
        Ok(Self {
            blocked,
            seq_len,
            batch: Some(batch),
        })
    }

    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Batch size for per-batch masks, `None` when shared.
    #[must_use]
    pub fn batch(&self) -> Option<usize> {
        self.batch
    }

    /// Underlying `u8` tensor.
    #[must_use]
    pub fn as_tensor(&self) -> &Tensor {
        &self.blocked
    }

    /// Rows of a shared `[L, L]` mask (first batch element for per-batch masks).
    ///
    /// # Errors
    /// Returns an error if tensor extraction fails.
    pub fn to_rows(&self) -> Result<Vec<Vec<bool>>> {
        let rows: Vec<Vec<u8>> = match self.batch {
            None => self.blocked.to_vec2()?,
            Some(_) => self.blocked.get(0)?.to_vec2()?,
        };
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v != 0).collect())
            .collect())
    }

    /// Set blocked entries of `scores` (shape `[B, H, L, L]`) to `-inf`.
    ///
    /// # Errors
    /// Returns [`TransformerError::ShapeMismatch`] if the mask does not match
    /// the score shape.
    pub(crate) fn fill_scores(&self, scores: &Tensor) -> Result<Tensor> {
        let (b, _h, q_len, k_len) = scores.dims4()?;
        if q_len != self.seq_len || k_len != self.seq_len {
            return Err(TransformerError::shape(
                "attention mask",
                format!("[{q_len}, {k_len}]"),
                self.blocked.dims(),
            ));
        }

        let mask = match self.batch {
            None => self.blocked.reshape((1, 1, self.seq_len, self.seq_len))?,
            Some(mb) if mb == b => self.blocked.unsqueeze(1)?,
            Some(_) => {
                return Err(TransformerError::shape(
                    "attention mask",
                    format!("[{b}, {q_len}, {k_len}]"),
                    self.blocked.dims(),
                ));
            }
        };
        let mask = mask.broadcast_as(scores.dims())?.contiguous()?;
        let neg_inf =
            Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?.to_dtype(scores.dtype())?;
        Ok(mask.where_cond(&neg_inf, scores)?)
    }
}

fn ensure_non_empty(seq_len: usize) -> Result<()> {
    if seq_len == 0 {
        return Err(TransformerError::shape("attention mask", "seq_len >= 1", &[0]));
    }
    Ok(())
}
