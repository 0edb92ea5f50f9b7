//! Multi-head scaled dot-product attention.
//!
//! Separate query/key/value projections, per-head softmax(QK^T / sqrt(d_k)) V,
//! head merge and output projection. Returns the head-averaged probability
//! map alongside the output for introspection.

use candle_core::{D, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::{validate_dropout, validate_heads};
use super::dropout::Dropout;
use super::mask::AttentionMask;
use crate::context::ExecutionContext;
use crate::error::{Result, TransformerError};

/// Axis order of a `[.., .., embed_dim]` sequence tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceLayout {
    /// `[seq_len, batch, embed_dim]`, used by the decoder
    SeqFirst,
    /// `[batch, seq_len, embed_dim]`, used by the encoder
    BatchFirst,
}

impl SequenceLayout {
    /// Split the leading two axes into `(batch, seq_len)`.
    #[must_use]
    pub fn batch_and_len(self, dims: (usize, usize)) -> (usize, usize) {
        match self {
            Self::SeqFirst => (dims.1, dims.0),
            Self::BatchFirst => dims,
        }
    }

    /// Explicitly move `x` into batch-first order.
    ///
    /// # Errors
    /// Returns an error if the transpose fails.
    pub fn to_batch_first(self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::SeqFirst => Ok(x.transpose(0, 1)?.contiguous()?),
            Self::BatchFirst => Ok(x.clone()),
        }
    }

    /// Move a batch-first `x` back into this layout.
    ///
    /// # Errors
    /// Returns an error if the transpose fails.
    pub fn to_layout(self, x: &Tensor) -> Result<Tensor> {
        self.to_batch_first(x)
    }
}

/// Multi-head attention with learned projections.
pub struct MultiHeadAttention {
    /// Query projection (embed_dim -> embed_dim)
    query: Linear,
    /// Key projection (embed_dim -> embed_dim)
    key: Linear,
    /// Value projection (embed_dim -> embed_dim)
    value: Linear,
    /// Output projection after head merge
    out: Linear,
    /// Applied to the probabilities after the softmax
    dropout: Dropout,
    num_heads: usize,
    embed_dim: usize,
    head_dim: usize,
    layout: SequenceLayout,
}

impl MultiHeadAttention {
    /// Create a new attention layer.
    ///
    /// # Errors
    /// Returns [`TransformerError::Config`] if `embed_dim` is not divisible by
    /// `num_heads` or `dropout` lies outside `[0, 1)`, or an error if weight
    /// creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        dropout: f32,
        layout: SequenceLayout,
        vb: VarBuilder,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        validate_heads(embed_dim, num_heads)?;
        validate_dropout(dropout)?;

        let query = candle_nn::linear(embed_dim, embed_dim, vb.pp("query"))?;
        let key = candle_nn::linear(embed_dim, embed_dim, vb.pp("key"))?;
        let value = candle_nn::linear(embed_dim, embed_dim, vb.pp("value"))?;
        let out = candle_nn::linear(embed_dim, embed_dim, vb.pp("out"))?;

        Ok(Self {
            query,
            key,
            value,
            out,
            dropout: ctx.dropout(dropout),
            num_heads,
            embed_dim,
            head_dim: embed_dim / num_heads,
            layout,
        })
    }

    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    #[must_use]
    pub fn layout(&self) -> SequenceLayout {
        self.layout
    }

    /// Inference forward pass.
    ///
    /// # Errors
    /// See [`Self::forward_t`].
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> Result<(Tensor, Tensor)> {
        self.forward_t(query, key, value, mask, false)
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `query`, `key`, `value` - Tensors of identical shape in this layer's layout
    /// * `mask` - Optional blocked-position mask
    /// * `train` - Enables dropout on the attention probabilities
    ///
    /// # Returns
    /// `(output, attention_map)`: output in the input layout, map of shape
    /// `(batch, seq_len, seq_len)` averaged over heads.
    ///
    /// # Errors
    /// Returns [`TransformerError::ShapeMismatch`] if the inputs disagree in
    /// shape or width, or if the mask does not fit the sequence.
    #[allow(clippy::many_single_char_names)]
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (d0, d1, c) = query.dims3()?;
        if c != self.embed_dim {
            return Err(TransformerError::shape(
                "attention input",
                format!("[_, _, {}]", self.embed_dim),
                query.dims(),
            ));
        }
        for other in [key, value] {
            if other.dims() != query.dims() {
                return Err(TransformerError::shape(
                    "attention key/value",
                    format!("{:?}", query.dims()),
                    other.dims(),
                ));
            }
        }
        let (b, t) = self.layout.batch_and_len((d0, d1));

        // Project, then (B, T, C) -> (B, n_head, T, head_dim)
        let q = self.split_heads(&self.query.forward(query)?, b, t)?;
        let k = self.split_heads(&self.key.forward(key)?, b, t)?;
        let v = self.split_heads(&self.value.forward(value)?, b, t)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let scores = (q.matmul(&k_t)? * scale)?;

        let scores = match mask {
            Some(mask) => mask.fill_scores(&scores)?,
            None => scores,
        };

        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        // Dropout after normalisation: rows no longer sum to one in training.
        let probs = self.dropout.forward_t(&probs, train)?;

        // (B, n_head, T, T) @ (B, n_head, T, head_dim) -> (B, T, C)
        let y = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.embed_dim))?;
        let y = self.layout.to_layout(&y)?;

        let output = self.out.forward(&y)?;
        let attention_map = probs.mean(1)?;
        Ok((output, attention_map))
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        let x = self.layout.to_batch_first(x)?;
        Ok(x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// Largest `|row_sum - 1|` over every row of an attention map.
///
/// # Errors
/// Returns an error if the map is not `(batch, seq_len, seq_len)`.
pub fn max_row_deviation(attention_map: &Tensor) -> Result<f32> {
    let sums: Vec<Vec<f32>> = attention_map.sum(D::Minus1)?.to_vec2()?;
    Ok(sums
        .iter()
        .flatten()
        .map(|s| (s - 1.0).abs())
        .fold(0.0, f32::max))
}
