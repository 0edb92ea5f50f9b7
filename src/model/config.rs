use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformerError};

/// Feed-forward width multiplier used by the classifier preset.
pub const FORWARD_EXPANSION: usize = 4;

/// Hyperparameters shared by the decoder and encoder stacks.
///
/// All fields are fixed at construction; tables are never resized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Rows of the token embedding table
    pub vocab_size: usize,
    /// Rows of the position embedding table, upper bound on sequence length
    pub max_seq_len: usize,
    /// Width of every embedding and projection
    pub embed_dim: usize,
    /// Number of attention heads, must divide `embed_dim`
    pub num_heads: usize,
    /// Hidden width of the position-wise feed-forward block
    pub ff_hidden_dim: usize,
    /// Number of stacked layers
    pub num_layers: usize,
    /// Dropout probability in `[0, 1)`
    pub dropout: f32,
}

impl ModelConfig {
    /// Dimension per attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns [`TransformerError::Config`] for non-positive dimensions, a head
    /// count that does not divide `embed_dim`, or a dropout outside `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("vocab_size", self.vocab_size),
            ("max_seq_len", self.max_seq_len),
            ("embed_dim", self.embed_dim),
            ("num_heads", self.num_heads),
            ("ff_hidden_dim", self.ff_hidden_dim),
            ("num_layers", self.num_layers),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(TransformerError::Config(format!("{name} must be positive")));
            }
        }
        validate_heads(self.embed_dim, self.num_heads)?;
        validate_dropout(self.dropout)
    }

    /// Set the feed-forward width to `factor * embed_dim`.
    #[must_use]
    pub fn with_forward_expansion(mut self, factor: usize) -> Self {
        self.ff_hidden_dim = factor * self.embed_dim;
        self
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the config is invalid.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Language-model preset: 32-token context, 64-wide, 2 heads, 4 layers.
    #[must_use]
    pub fn language_model(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len: 32,
            embed_dim: 64,
            num_heads: 2,
            ff_hidden_dim: 100,
            num_layers: 4,
            dropout: 0.1,
        }
    }

    /// Encoder preset used by [`ClassifierConfig::speeches`].
    #[must_use]
    pub fn encoder(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len: 32,
            embed_dim: 64,
            num_heads: 2,
            ff_hidden_dim: 0,
            num_layers: 4,
            dropout: 0.0,
        }
        .with_forward_expansion(FORWARD_EXPANSION)
    }
}

/// Encoder hyperparameters plus the number of output classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(flatten)]
    pub encoder: ModelConfig,
    pub num_classes: usize,
}

impl ClassifierConfig {
    /// Validate the encoder settings and the class count.
    ///
    /// # Errors
    /// Returns [`TransformerError::Config`] if any field is invalid.
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        if self.num_classes == 0 {
            return Err(TransformerError::Config(
                "num_classes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the config is invalid.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Three-way speaker classification preset.
    #[must_use]
    pub fn speeches(vocab_size: usize) -> Self {
        Self {
            encoder: ModelConfig::encoder(vocab_size),
            num_classes: 3,
        }
    }
}

pub(crate) fn validate_heads(embed_dim: usize, num_heads: usize) -> Result<()> {
    if num_heads == 0 || !embed_dim.is_multiple_of(num_heads) {
        return Err(TransformerError::Config(format!(
            "embed_dim {embed_dim} must be divisible by num_heads {num_heads}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_dropout(p: f32) -> Result<()> {
    if !(0.0..1.0).contains(&p) {
        return Err(TransformerError::Config(format!(
            "dropout {p} must lie in [0, 1)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(ModelConfig::language_model(100).validate().is_ok());
        assert!(ClassifierConfig::speeches(100).validate().is_ok());
        assert_eq!(ModelConfig::encoder(10).ff_hidden_dim, 256);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        for (embed_dim, num_heads) in [(64, 3), (10, 4), (4, 8)] {
            let config = ModelConfig {
                embed_dim,
                num_heads,
                ..ModelConfig::language_model(10)
            };
            assert!(matches!(
                config.validate(),
                Err(TransformerError::Config(_))
            ));
        }
    }

    #[test]
    fn test_dropout_range() {
        for p in [-0.1, 1.0, 1.5, f32::NAN] {
            let config = ModelConfig {
                dropout: p,
                ..ModelConfig::language_model(10)
            };
            assert!(config.validate().is_err(), "dropout {p} accepted");
        }
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let config = ModelConfig {
            num_layers: 0,
            ..ModelConfig::language_model(10)
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("num_layers"));
    }

    #[test]
    fn test_classifier_json_round_trip() {
        let raw = r#"{
            "vocab_size": 50, "max_seq_len": 16, "embed_dim": 8, "num_heads": 2,
            "ff_hidden_dim": 32, "num_layers": 1, "dropout": 0.0, "num_classes": 3
        }"#;
        let config = ClassifierConfig::from_json(raw).unwrap();
        assert_eq!(config.encoder.head_dim(), 4);
        assert_eq!(config.num_classes, 3);

        let bad = raw.replace("\"num_classes\": 3", "\"num_classes\": 0");
        assert!(ClassifierConfig::from_json(&bad).is_err());
    }
}
