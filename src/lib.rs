#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! Small from-scratch transformer: a causal decoder language model and a
//! bidirectional encoder classifier, built on candle tensors.

pub mod context;
pub mod error;
pub mod loss;
pub mod model;
pub mod weights;

pub use context::{DropoutSource, ExecutionContext};
pub use error::{Result, TransformerError};
pub use model::{
    AttentionMask, ClassifierConfig, DecoderStack, ModelConfig, MultiHeadAttention,
    SequenceClassifier,
};
pub use weights::{ParameterStore, init_classifier, init_language_model};
