pub mod attention;
pub mod config;
pub mod decoder;
pub mod dropout;
pub mod embedding;
pub mod encoder;
pub mod layers;
pub mod mask;

// Re-exports for convenience
pub use attention::{MultiHeadAttention, SequenceLayout, max_row_deviation};
pub use config::{ClassifierConfig, FORWARD_EXPANSION, ModelConfig};
pub use decoder::{DecoderOutput, DecoderStack};
pub use dropout::Dropout;
pub use embedding::{PositionEmbedding, SequenceEmbedding, TokenEmbedding, validate_token_ids};
pub use encoder::{ClassifierHead, ClassifierOutput, EncoderStack, SequenceClassifier, mean_pool};
pub use layers::{DecoderLayer, EncoderLayer, FeedForward, LayerNorm, ResidualNorm};
pub use mask::AttentionMask;
