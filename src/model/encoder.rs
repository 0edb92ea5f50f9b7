//! Bidirectional encoder and mean-pooled classification head.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use super::attention::SequenceLayout;
use super::config::{ClassifierConfig, ModelConfig};
use super::embedding::SequenceEmbedding;
use super::layers::EncoderLayer;
use super::mask::AttentionMask;
use crate::context::ExecutionContext;
use crate::error::Result;

/// Encoder over batch-first `(batch, seq_len)` token ids.
pub struct EncoderStack {
    embedding: SequenceEmbedding,
    layers: Vec<EncoderLayer>,
    config: ModelConfig,
}

impl EncoderStack {
    /// # Errors
    /// Returns [`crate::TransformerError::Config`] for an invalid config, or an
    /// error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: ModelConfig, vb: VarBuilder, ctx: &ExecutionContext) -> Result<Self> {
        config.validate()?;

        let embedding =
            SequenceEmbedding::new(&config, SequenceLayout::BatchFirst, vb.clone(), ctx)?;
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(EncoderLayer::new(&config, vb.pp(format!("layers.{i}")), ctx)?);
        }

        Ok(Self {
            embedding,
            layers,
            config,
        })
    }

    /// Encode a batch of sequences.
    ///
    /// # Arguments
    /// * `token_ids` - Integer ids of shape (batch, seq_len)
    /// * `mask` - Optional caller-built padding mask; no causal constraint is applied
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Hidden states of shape (batch, seq_len, embed_dim) and per-layer attention maps.
    ///
    /// # Errors
    /// Returns an error for malformed ids or a mask that does not fit.
    pub fn forward_t(
        &self,
        token_ids: &Tensor,
        mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut x = self.embedding.forward_t(token_ids, train)?;
        let mut attention_maps = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, attention_map) = layer.forward_t(&x, mask, train)?;
            x = next;
            attention_maps.push(attention_map);
        }
        Ok((x, attention_maps))
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

/// Unweighted mean over the sequence axis of a (batch, seq_len, embed_dim) tensor.
///
/// Every position counts equally, padding included.
///
/// # Errors
/// Returns an error if `hidden` is not rank 3.
pub fn mean_pool(hidden: &Tensor) -> Result<Tensor> {
    hidden.dims3()?;
    Ok(hidden.mean(1)?)
}

/// Linear projection of pooled vectors to class logits.
pub struct ClassifierHead {
    fc: Linear,
}

impl ClassifierHead {
    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(embed_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: candle_nn::linear(embed_dim, num_classes, vb)?,
        })
    }

    /// Map pooled (batch, embed_dim) vectors to (batch, num_classes) logits.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, pooled: &Tensor) -> Result<Tensor> {
        Ok(self.fc.forward(pooled)?)
    }
}

/// Classifier logits with the intermediate pooled representation.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    /// Shape (batch, num_classes)
    pub logits: Tensor,
    /// Shape (batch, embed_dim)
    pub pooled: Tensor,
    /// Per-layer maps of shape (batch, seq_len, seq_len)
    pub attention_maps: Vec<Tensor>,
}

/// Encoder stack followed by mean pooling and a linear head.
pub struct SequenceClassifier {
    encoder: EncoderStack,
    head: ClassifierHead,
    config: ClassifierConfig,
}

impl SequenceClassifier {
    /// # Errors
    /// Returns [`crate::TransformerError::Config`] for an invalid config, or an
    /// error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: ClassifierConfig, vb: VarBuilder, ctx: &ExecutionContext) -> Result<Self> {
        config.validate()?;

        let encoder = EncoderStack::new(config.encoder.clone(), vb.pp("encoder"), ctx)?;
        let head = ClassifierHead::new(config.encoder.embed_dim, config.num_classes, vb.pp("fc"))?;

        log::debug!(
            "sequence classifier: layers={} heads={} embed_dim={} classes={}",
            config.encoder.num_layers,
            config.encoder.num_heads,
            config.encoder.embed_dim,
            config.num_classes
        );
        if config.encoder.dropout > 0.0 && !ctx.dropout_enabled() {
            log::info!(
                "dropout {} configured but the execution context disables it",
                config.encoder.dropout
            );
        }

        Ok(Self {
            encoder,
            head,
            config,
        })
    }

    /// Inference forward pass without a mask.
    ///
    /// # Errors
    /// See [`Self::forward_t`].
    pub fn forward(&self, token_ids: &Tensor) -> Result<ClassifierOutput> {
        self.forward_t(token_ids, None, false)
    }

    /// Classify a batch of sequences.
    ///
    /// # Arguments
    /// * `token_ids` - Integer ids of shape (batch, seq_len)
    /// * `mask` - Optional padding mask
    /// * `train` - Enables dropout
    ///
    /// # Errors
    /// Returns an error for malformed ids or a mask that does not fit.
    pub fn forward_t(
        &self,
        token_ids: &Tensor,
        mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<ClassifierOutput> {
        log::trace!("classifier forward: ids={:?} train={train}", token_ids.dims());
        let (hidden, attention_maps) = self.encoder.forward_t(token_ids, mask, train)?;
        let pooled = mean_pool(&hidden)?;
        let logits = self.head.forward(&pooled)?;
        Ok(ClassifierOutput {
            logits,
            pooled,
            attention_maps,
        })
    }

    #[must_use]
    pub fn encoder(&self) -> &EncoderStack {
        &self.encoder
    }

    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }
}
