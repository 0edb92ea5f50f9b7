//! Embedding layers for the transformer.
//!
//! Learned token and position tables combined by elementwise addition.

use candle_core::{DType, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use super::attention::SequenceLayout;
use super::config::ModelConfig;
use super::dropout::Dropout;
use crate::context::ExecutionContext;
use crate::error::{Result, TransformerError};

/// Token embedding layer (vocab_size x embed_dim).
pub struct TokenEmbedding {
    embedding: Embedding,
    vocab_size: usize,
}

impl TokenEmbedding {
    /// Create a new token embedding layer.
    ///
    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.vocab_size, config.embed_dim, vb)?;
        Ok(Self {
            embedding,
            vocab_size: config.vocab_size,
        })
    }

    /// Look up embeddings for already validated `u32` ids of any shape.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(token_ids)?)
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[must_use]
    pub fn weights(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

/// Learned absolute position embedding (max_seq_len x embed_dim).
pub struct PositionEmbedding {
    embedding: Embedding,
    max_seq_len: usize,
}

impl PositionEmbedding {
    /// Create a new position embedding layer.
    ///
    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.max_seq_len, config.embed_dim, vb)?;
        Ok(Self {
            embedding,
            max_seq_len: config.max_seq_len,
        })
    }

    /// Embeddings for positions `0..seq_len`, shape `(seq_len, embed_dim)`.
    ///
    /// # Errors
    /// Returns [`TransformerError::OutOfRange`] if `seq_len` exceeds the table.
    pub fn forward(&self, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.max_seq_len {
            return Err(TransformerError::OutOfRange {
                what: "sequence length",
                value: i64::try_from(seq_len).unwrap_or(i64::MAX),
                limit: self.max_seq_len,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let positions = Tensor::arange(0u32, seq_len as u32, self.embedding.embeddings().device())?;
        Ok(self.embedding.forward(&positions)?)
    }
}

/// Token plus position embedding with dropout on the sum.
pub struct SequenceEmbedding {
    token: TokenEmbedding,
    position: PositionEmbedding,
    dropout: Dropout,
    layout: SequenceLayout,
}

impl SequenceEmbedding {
    /// # Errors
    /// Returns an error if weight creation fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        config: &ModelConfig,
        layout: SequenceLayout,
        vb: VarBuilder,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        Ok(Self {
            token: TokenEmbedding::new(config, vb.pp("token_embedding"))?,
            position: PositionEmbedding::new(config, vb.pp("position_embedding"))?,
            dropout: ctx.dropout(config.dropout),
            layout,
        })
    }

    /// Embed a rank-2 id tensor laid out per `layout`.
    ///
    /// # Returns
    /// `(.., .., embed_dim)` in the same axis order as the ids.
    ///
    /// # Errors
    /// Returns an error for a wrong rank, a non-integer dtype, an id outside
    /// the vocabulary or a sequence longer than the position table.
    pub fn forward_t(&self, token_ids: &Tensor, train: bool) -> Result<Tensor> {
        let expected = match self.layout {
            SequenceLayout::SeqFirst => "[seq_len, batch]",
            SequenceLayout::BatchFirst => "[batch, seq_len]",
        };
        let dims = token_ids
            .dims2()
            .map_err(|_| TransformerError::shape("token ids", expected, token_ids.dims()))?;
        let (_, seq_len) = self.layout.batch_and_len(dims);
        if seq_len == 0 {
            return Err(TransformerError::shape("token ids", expected, token_ids.dims()));
        }

        let ids = validate_token_ids(token_ids, self.token.vocab_size())?;
        let tok = self.token.forward(&ids)?;
        let pos = self.position.forward(seq_len)?;
        let pos = match self.layout {
            SequenceLayout::SeqFirst => pos.unsqueeze(1)?,
            SequenceLayout::BatchFirst => pos.unsqueeze(0)?,
        };

        let x = tok.broadcast_add(&pos)?;
        self.dropout.forward_t(&x, train)
    }
}

/// Check that every id lies in `[0, vocab_size)` and return them as `u32`.
///
/// # Errors
/// Returns [`TransformerError::TokenDType`] for float ids and
/// [`TransformerError::OutOfRange`] for any id outside the vocabulary.
pub fn validate_token_ids(token_ids: &Tensor, vocab_size: usize) -> Result<Tensor> {
    match token_ids.dtype() {
        DType::U8 | DType::U32 | DType::I64 => {}
        other => return Err(TransformerError::TokenDType(other)),
    }

    let values = token_ids
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;
    let limit = i64::try_from(vocab_size).unwrap_or(i64::MAX);
    if let Some(bad) = values.iter().find(|&&id| id < 0 || id >= limit) {
        return Err(TransformerError::OutOfRange {
            what: "token id",
            value: *bad,
            limit: vocab_size,
        });
    }

    Ok(token_ids.to_dtype(DType::U32)?)
}
