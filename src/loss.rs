//! Training objectives over model logits.
//!
//! Forward-only: the scalar losses returned here are what an external
//! optimizer calls `backward` on.

use candle_core::{DType, Tensor};

use crate::error::{Result, TransformerError};

/// Mean next-token cross-entropy.
///
/// # Arguments
/// * `logits` - Decoder logits of shape (seq_len, batch, vocab_size)
/// * `targets` - Target ids of shape (seq_len, batch)
///
/// # Errors
/// Returns an error if the shapes disagree or a target is outside the vocabulary.
pub fn language_model_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (seq_len, batch, vocab) = logits.dims3()?;
    if targets.dims() != &[seq_len, batch] {
        return Err(TransformerError::shape(
            "language model targets",
            format!("[{seq_len}, {batch}]"),
            targets.dims(),
        ));
    }
    let targets = check_labels(targets, vocab, "target id")?;
    let logits = logits.reshape((seq_len * batch, vocab))?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets.flatten_all()?)?)
}

/// Mean classification cross-entropy.
///
/// # Arguments
/// * `logits` - Classifier logits of shape (batch, num_classes)
/// * `labels` - Class indices of shape (batch,)
///
/// # Errors
/// Returns an error if the shapes disagree or a label is outside `[0, num_classes)`.
pub fn classification_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, num_classes) = logits.dims2()?;
    if labels.dims() != &[batch] {
        return Err(TransformerError::shape(
            "class labels",
            format!("[{batch}]"),
            labels.dims(),
        ));
    }
    let labels = check_labels(labels, num_classes, "class label")?;
    Ok(candle_nn::loss::cross_entropy(logits, &labels)?)
}

fn check_labels(labels: &Tensor, limit: usize, what: &'static str) -> Result<Tensor> {
    match labels.dtype() {
        DType::U8 | DType::U32 | DType::I64 => {}
        other => return Err(TransformerError::TokenDType(other)),
    }
    let values = labels.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    let max = i64::try_from(limit).unwrap_or(i64::MAX);
    if let Some(bad) = values.iter().find(|&&v| v < 0 || v >= max) {
        return Err(TransformerError::OutOfRange {
            what,
            value: *bad,
            limit,
        });
    }
    Ok(labels.to_dtype(DType::U32)?)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((3, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((3, 2), DType::U32, &Device::Cpu).unwrap();
        let loss: f32 = language_model_loss(&logits, &targets)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 8f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_confident_correct_class_has_small_loss() {
        let logits = Tensor::new(&[[10f32, 0.0, 0.0], [0.0, 0.0, 10.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let loss: f32 = classification_loss(&logits, &labels)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn test_label_out_of_range() {
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 3], &Device::Cpu).unwrap();
        assert!(matches!(
            classification_loss(&logits, &labels),
            Err(TransformerError::OutOfRange { value: 3, .. })
        ));
    }

    #[test]
    fn test_target_shape_mismatch() {
        let logits = Tensor::zeros((3, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            language_model_loss(&logits, &targets),
            Err(TransformerError::ShapeMismatch { .. })
        ));
    }
}
