//! Feed-forward, residual-norm and the two transformer layer variants.
//!
//! Both layers are post-norm: attention -> residual+norm -> FFN -> residual+norm.

use candle_core::{D, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::attention::{MultiHeadAttention, SequenceLayout};
use super::config::ModelConfig;
use super::dropout::Dropout;
use super::mask::AttentionMask;
use crate::context::ExecutionContext;
use crate::error::Result;

/// Position-wise feed-forward network with ReLU.
///
/// fc1 (embed_dim -> ff_hidden_dim) -> ReLU -> fc2 (ff_hidden_dim -> embed_dim)
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    /// Create a new feed-forward block.
    ///
    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(embed_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = candle_nn::linear(embed_dim, hidden_dim, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden_dim, embed_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    /// Apply to the last axis of `x`, any leading shape.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.relu()?;
        Ok(self.fc2.forward(&h)?)
    }
}

/// Per-token normalisation over the embedding axis with learned scale and shift.
///
/// Built from elementwise ops so gradients flow through it.
pub struct LayerNorm {
    /// Scale, initialised to ones
    weight: Tensor,
    /// Shift, initialised to zeros
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f64 = 1e-5;

    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(embed_dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(embed_dim, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: Self::DEFAULT_EPS,
        })
    }

    /// Normalise the last axis to zero mean and unit (biased) variance, then
    /// apply the affine transform.
    ///
    /// # Errors
    /// Returns an error if the last axis does not match the weight width.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// `layer_norm(x + dropout(y))` around a sub-layer output `y`.
pub struct ResidualNorm {
    norm: LayerNorm,
    dropout: Dropout,
}

impl ResidualNorm {
    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(embed_dim: usize, dropout: Dropout, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: LayerNorm::new(embed_dim, vb)?,
            dropout,
        })
    }

    /// # Errors
    /// Returns an error if `x` and `y` differ in shape.
    pub fn forward_t(&self, x: &Tensor, y: &Tensor, train: bool) -> Result<Tensor> {
        let y = self.dropout.forward_t(y, train)?;
        self.norm.forward(&(x + y)?)
    }
}

/// Attention and feed-forward sub-layers shared by both layer kinds.
struct Sublayers {
    attention: MultiHeadAttention,
    attn_norm: ResidualNorm,
    feed_forward: FeedForward,
    ff_norm: ResidualNorm,
}

impl Sublayers {
    #[allow(clippy::needless_pass_by_value)]
    fn new(
        config: &ModelConfig,
        layout: SequenceLayout,
        vb: VarBuilder,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        let attention = MultiHeadAttention::new(
            config.embed_dim,
            config.num_heads,
            config.dropout,
            layout,
            vb.pp("attention"),
            ctx,
        )?;
        let attn_norm = ResidualNorm::new(
            config.embed_dim,
            ctx.dropout(config.dropout),
            vb.pp("attn_norm"),
        )?;
        let feed_forward =
            FeedForward::new(config.embed_dim, config.ff_hidden_dim, vb.pp("feed_forward"))?;
        let ff_norm = ResidualNorm::new(
            config.embed_dim,
            ctx.dropout(config.dropout),
            vb.pp("ff_norm"),
        )?;
        Ok(Self {
            attention,
            attn_norm,
            feed_forward,
            ff_norm,
        })
    }

    fn forward_t(
        &self,
        x: &Tensor,
        mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (attn, attention_map) = self.attention.forward_t(x, x, x, mask, train)?;
        let x = self.attn_norm.forward_t(x, &attn, train)?;

        let ff = self.feed_forward.forward(&x)?;
        let x = self.ff_norm.forward_t(&x, &ff, train)?;
        Ok((x, attention_map))
    }
}

/// Causally masked layer over `(seq_len, batch, embed_dim)` tensors.
pub struct DecoderLayer {
    inner: Sublayers,
}

impl DecoderLayer {
    /// # Errors
    /// Returns an error if the config is invalid or weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder, ctx: &ExecutionContext) -> Result<Self> {
        Ok(Self {
            inner: Sublayers::new(config, SequenceLayout::SeqFirst, vb, ctx)?,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input of shape (seq_len, batch, embed_dim)
    /// * `mask` - Causal mask for `seq_len`
    ///
    /// # Returns
    /// Updated sequence of the same shape and the (batch, seq_len, seq_len) attention map.
    ///
    /// # Errors
    /// Returns an error if the mask does not fit or tensor operations fail.
    pub fn forward_t(
        &self,
        x: &Tensor,
        mask: &AttentionMask,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        self.inner.forward_t(x, Some(mask), train)
    }
}

/// Bidirectional layer over `(batch, seq_len, embed_dim)` tensors.
pub struct EncoderLayer {
    inner: Sublayers,
}

impl EncoderLayer {
    /// # Errors
    /// Returns an error if the config is invalid or weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder, ctx: &ExecutionContext) -> Result<Self> {
        Ok(Self {
            inner: Sublayers::new(config, SequenceLayout::BatchFirst, vb, ctx)?,
        })
    }

    /// Forward pass; `mask` is only ever a caller-supplied padding mask.
    ///
    /// # Errors
    /// Returns an error if the mask does not fit or tensor operations fail.
    pub fn forward_t(
        &self,
        x: &Tensor,
        mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        self.inner.forward_t(x, mask, train)
    }
}
