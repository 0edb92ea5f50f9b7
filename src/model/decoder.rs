//! Decoder-only language model.
//!
//! Token + position embedding -> causally masked decoder layers -> vocabulary
//! projection. Operates on sequence-first `(seq_len, batch)` token ids.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use super::attention::SequenceLayout;
use super::config::ModelConfig;
use super::embedding::SequenceEmbedding;
use super::layers::DecoderLayer;
use super::mask::AttentionMask;
use crate::context::ExecutionContext;
use crate::error::Result;

/// Logits plus one attention map per layer.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Unnormalised scores of shape (seq_len, batch, vocab_size)
    pub logits: Tensor,
    /// Per-layer maps of shape (batch, seq_len, seq_len)
    pub attention_maps: Vec<Tensor>,
}

/// Causal transformer language model.
pub struct DecoderStack {
    embedding: SequenceEmbedding,
    layers: Vec<DecoderLayer>,
    /// Output projection to vocabulary logits
    lm_head: Linear,
    config: ModelConfig,
    ctx: ExecutionContext,
}

impl DecoderStack {
    /// Create a new decoder stack.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder supplying (or initialising) the weights
    /// * `ctx` - Device and dropout randomness
    ///
    /// # Errors
    /// Returns [`crate::TransformerError::Config`] for an invalid config, or an
    /// error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: ModelConfig, vb: VarBuilder, ctx: &ExecutionContext) -> Result<Self> {
        config.validate()?;

        let embedding = SequenceEmbedding::new(&config, SequenceLayout::SeqFirst, vb.clone(), ctx)?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(DecoderLayer::new(&config, vb.pp(format!("layers.{i}")), ctx)?);
        }

        let lm_head = candle_nn::linear(config.embed_dim, config.vocab_size, vb.pp("lm_head"))?;

        log::debug!(
            "decoder stack: layers={} heads={} embed_dim={} vocab={} max_seq_len={}",
            config.num_layers,
            config.num_heads,
            config.embed_dim,
            config.vocab_size,
            config.max_seq_len
        );
        if config.dropout > 0.0 && !ctx.dropout_enabled() {
            log::info!(
                "dropout {} configured but the execution context disables it",
                config.dropout
            );
        }

        Ok(Self {
            embedding,
            layers,
            lm_head,
            config,
            ctx: ctx.clone(),
        })
    }

    /// Inference forward pass.
    ///
    /// # Errors
    /// See [`Self::forward_t`].
    pub fn forward(&self, token_ids: &Tensor) -> Result<DecoderOutput> {
        self.forward_t(token_ids, false)
    }

    /// Forward pass through the model.
    ///
    /// # Arguments
    /// * `token_ids` - Integer ids of shape (seq_len, batch)
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Logits of shape (seq_len, batch, vocab_size) and per-layer attention maps.
    ///
    /// # Errors
    /// Returns an error if the ids have the wrong rank or dtype, contain an id
    /// outside the vocabulary, or are longer than `max_seq_len`.
    pub fn forward_t(&self, token_ids: &Tensor, train: bool) -> Result<DecoderOutput> {
        log::trace!("decoder forward: ids={:?} train={train}", token_ids.dims());
        let mut x = self.embedding.forward_t(token_ids, train)?;
        let (seq_len, _, _) = x.dims3()?;

        // One causal mask shared by every layer.
        let mask = AttentionMask::causal(seq_len, self.ctx.device())?;

        let mut attention_maps = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, attention_map) = layer.forward_t(&x, &mask, train)?;
            x = next;
            attention_maps.push(attention_map);
        }

        let logits = self.lm_head.forward(&x)?;
        Ok(DecoderOutput {
            logits,
            attention_maps,
        })
    }

    /// Logits for the last position only.
    ///
    /// # Returns
    /// Tensor of shape (batch, vocab_size)
    ///
    /// # Errors
    /// See [`Self::forward_t`].
    pub fn forward_last(&self, token_ids: &Tensor) -> Result<Tensor> {
        let logits = self.forward(token_ids)?.logits;
        let (t, _, _) = logits.dims3()?;
        Ok(logits.narrow(0, t - 1, 1)?.squeeze(0)?)
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
}
