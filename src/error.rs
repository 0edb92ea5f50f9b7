//! Error types for model construction and forward passes.

use candle_core::DType;
use thiserror::Error;

/// Errors raised by the transformer stacks.
///
/// Every variant reflects caller misuse or a backend failure; nothing is
/// retried or defaulted inside the crate.
#[derive(Error, Debug)]
pub enum TransformerError {
    /// Invalid hyperparameters, raised at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An input tensor or mask does not match the expected layout.
    #[error("shape mismatch for {context}: expected {expected}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        got: Vec<usize>,
    },
    /// A token id or position index exceeds its table.
    #[error("{what} {value} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: i64,
        limit: usize,
    },
    /// Mask that would leave a query with nothing to attend to.
    #[error("invalid attention mask: {0}")]
    InvalidMask(String),
    #[error("token ids must be an integer tensor, got {0:?}")]
    TokenDType(DType),
    /// Missing or mis-shaped tensor while restoring weights.
    #[error("weights: {0}")]
    Weights(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransformerError>;

impl TransformerError {
    pub(crate) fn shape(context: &'static str, expected: impl Into<String>, got: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.into(),
            got: got.to_vec(),
        }
    }
}
