use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tiny_transformer::loss::{classification_loss, language_model_loss};
use tiny_transformer::model::max_row_deviation;
use tiny_transformer::{
    AttentionMask, ClassifierConfig, DropoutSource, ExecutionContext, ModelConfig,
    TransformerError, init_classifier, init_language_model,
};

fn decoder_config(num_layers: usize) -> ModelConfig {
    ModelConfig {
        vocab_size: 10,
        max_seq_len: 8,
        embed_dim: 4,
        num_heads: 2,
        ff_hidden_dim: 16,
        num_layers,
        dropout: 0.0,
    }
}

fn classifier_config() -> ClassifierConfig {
    ClassifierConfig {
        encoder: ModelConfig {
            vocab_size: 30,
            max_seq_len: 8,
            embed_dim: 8,
            num_heads: 2,
            ff_hidden_dim: 32,
            num_layers: 2,
            dropout: 0.0,
        },
        num_classes: 3,
    }
}

fn column(ids: &[u32]) -> anyhow::Result<Tensor> {
    Ok(Tensor::new(ids, &Device::Cpu)?.unsqueeze(1)?)
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[test]
fn zero_weights_yield_output_bias_everywhere() -> anyhow::Result<()> {
    let ctx = ExecutionContext::cpu();
    let (model, store) = init_language_model(decoder_config(1), &ctx)?;

    for name in store.names() {
        let var = store.get(&name).expect("listed parameter");
        store.set(&name, &var.zeros_like()?)?;
    }
    let bias: Vec<f32> = (0..10u8).map(|i| f32::from(i) * 0.5 - 2.0).collect();
    store.set("lm_head.bias", &Tensor::new(bias.as_slice(), &Device::Cpu)?)?;

    let logits = model.forward(&column(&[3, 1, 7])?)?.logits;
    assert_eq!(logits.dims(), &[3, 1, 10]);
    for position in logits.squeeze(1)?.to_vec2::<f32>()? {
        assert!(max_abs_diff(&position, &bias) < 1e-6, "{position:?}");
    }
    Ok(())
}

#[test]
fn decoder_logits_ignore_future_tokens() -> anyhow::Result<()> {
    let (model, _) = init_language_model(decoder_config(2), &ExecutionContext::cpu())?;

    let original = model.forward(&column(&[1, 2, 3, 4, 5])?)?.logits.squeeze(1)?;
    let perturbed = model.forward(&column(&[1, 2, 3, 8, 0])?)?.logits.squeeze(1)?;
    let original = original.to_vec2::<f32>()?;
    let perturbed = perturbed.to_vec2::<f32>()?;

    for i in 0..3 {
        assert!(
            max_abs_diff(&original[i], &perturbed[i]) < 1e-5,
            "position {i} saw a future token"
        );
    }
    assert!(max_abs_diff(&original[4], &perturbed[4]) > 0.0);
    Ok(())
}

#[test]
fn forward_is_deterministic_without_dropout() -> anyhow::Result<()> {
    let (model, _) = init_language_model(decoder_config(2), &ExecutionContext::cpu())?;
    let ids = Tensor::new(&[[1u32, 4], [2, 5], [3, 6]], &Device::Cpu)?;

    let a = model.forward(&ids)?.logits.flatten_all()?.to_vec1::<f32>()?;
    let b = model.forward(&ids)?.logits.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn stack_shape_laws() -> anyhow::Result<()> {
    let ctx = ExecutionContext::cpu();

    let (decoder, _) = init_language_model(decoder_config(2), &ctx)?;
    let ids = Tensor::zeros((7, 3), DType::U32, &Device::Cpu)?;
    let out = decoder.forward(&ids)?;
    assert_eq!(out.logits.dims(), &[7, 3, 10]);
    assert_eq!(out.attention_maps.len(), 2);

    let (classifier, _) = init_classifier(classifier_config(), &ctx)?;
    let ids = Tensor::zeros((5, 8), DType::U32, &Device::Cpu)?;
    let out = classifier.forward(&ids)?;
    assert_eq!(out.logits.dims(), &[5, 3]);
    Ok(())
}

#[test]
fn attention_maps_are_row_normalised() -> anyhow::Result<()> {
    let ctx = ExecutionContext::cpu();

    let (decoder, _) = init_language_model(decoder_config(2), &ctx)?;
    let ids = Tensor::new(&[[1u32, 2], [3, 4], [5, 6], [7, 8]], &Device::Cpu)?;
    for map in decoder.forward(&ids)?.attention_maps {
        assert!(max_row_deviation(&map)? < 1e-5);
    }

    let (classifier, _) = init_classifier(classifier_config(), &ctx)?;
    let ids = Tensor::new(&[[11u32, 12, 13, 0], [21, 22, 0, 0]], &Device::Cpu)?;
    let padding = vec![
        vec![false, false, false, true],
        vec![false, false, true, true],
    ];
    let mask = AttentionMask::key_padding(&padding, &Device::Cpu)?;
    for map in classifier.forward_t(&ids, Some(&mask), false)?.attention_maps {
        assert!(max_row_deviation(&map)? < 1e-5);
    }
    Ok(())
}

#[test]
fn pooled_vector_is_unweighted_mean_of_positions() -> anyhow::Result<()> {
    let (classifier, _) = init_classifier(classifier_config(), &ExecutionContext::cpu())?;
    let ids = Tensor::new(&[[5u32, 9, 2, 0, 0]], &Device::Cpu)?;

    let out = classifier.forward(&ids)?;
    let (hidden, _) = classifier.encoder().forward_t(&ids, None, false)?;
    let hidden = hidden.squeeze(0)?.to_vec2::<f32>()?;

    #[allow(clippy::cast_precision_loss)]
    let n = hidden.len() as f32;
    let manual: Vec<f32> = (0..8)
        .map(|c| hidden.iter().map(|row| row[c]).sum::<f32>() / n)
        .collect();
    let pooled = out.pooled.squeeze(0)?.to_vec1::<f32>()?;
    assert!(max_abs_diff(&manual, &pooled) < 1e-5);

    // Extra padding positions take part in the average.
    let longer = Tensor::new(&[[5u32, 9, 2, 0, 0, 0, 0]], &Device::Cpu)?;
    let pooled_longer = classifier.forward(&longer)?.pooled.squeeze(0)?.to_vec1::<f32>()?;
    assert!(max_abs_diff(&pooled, &pooled_longer) > 1e-6);
    Ok(())
}

#[test]
fn caller_errors_surface_immediately() -> anyhow::Result<()> {
    let ctx = ExecutionContext::cpu();
    let (decoder, _) = init_language_model(decoder_config(1), &ctx)?;

    let too_big = column(&[1, 10])?;
    assert!(matches!(
        decoder.forward(&too_big),
        Err(TransformerError::OutOfRange { what: "token id", .. })
    ));

    let rank_three = Tensor::zeros((2, 1, 1), DType::U32, &Device::Cpu)?;
    assert!(matches!(
        decoder.forward(&rank_three),
        Err(TransformerError::ShapeMismatch { .. })
    ));

    let (classifier, _) = init_classifier(classifier_config(), &ctx)?;
    let ids = Tensor::zeros((1, 4), DType::U32, &Device::Cpu)?;
    let wrong_len = AttentionMask::causal(3, &Device::Cpu)?;
    assert!(matches!(
        classifier.forward_t(&ids, Some(&wrong_len), false),
        Err(TransformerError::ShapeMismatch { .. })
    ));

    let bad_heads = ModelConfig {
        embed_dim: 6,
        num_heads: 4,
        ..decoder_config(1)
    };
    assert!(matches!(
        init_language_model(bad_heads, &ctx),
        Err(TransformerError::Config(_))
    ));
    Ok(())
}

#[test]
fn seeded_dropout_only_acts_in_training() -> anyhow::Result<()> {
    let config = ModelConfig {
        dropout: 0.5,
        ..decoder_config(2)
    };
    let ctx = ExecutionContext::new(Device::Cpu, DropoutSource::Seeded(1234));
    let (model, _) = init_language_model(config, &ctx)?;
    let ids = column(&[1, 2, 3, 4])?;

    let eval_a = model.forward_t(&ids, false)?.logits.flatten_all()?.to_vec1::<f32>()?;
    let eval_b = model.forward_t(&ids, false)?.logits.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(eval_a, eval_b);

    let train = model.forward_t(&ids, true)?.logits.flatten_all()?.to_vec1::<f32>()?;
    assert!(max_abs_diff(&eval_a, &train) > 0.0);
    Ok(())
}

#[test]
fn optimizer_updates_weights_through_store() -> anyhow::Result<()> {
    let ctx = ExecutionContext::cpu();
    let (model, store) = init_language_model(decoder_config(1), &ctx)?;
    let inputs = column(&[1, 2, 3, 4])?;
    let targets = column(&[2, 3, 4, 5])?;

    let before = model.forward(&inputs)?.logits;
    let loss = language_model_loss(&before, &targets)?;

    let params = ParamsAdamW {
        lr: 1e-2,
        ..ParamsAdamW::default()
    };
    let mut optimizer = AdamW::new(store.trainable_vars(), params)?;
    optimizer.backward_step(&loss)?;

    let after = model.forward(&inputs)?.logits;
    let before = before.flatten_all()?.to_vec1::<f32>()?;
    let after = after.flatten_all()?.to_vec1::<f32>()?;
    assert!(max_abs_diff(&before, &after) > 0.0);
    Ok(())
}

#[test]
fn classification_loss_over_classifier_logits() -> anyhow::Result<()> {
    let (classifier, _) = init_classifier(classifier_config(), &ExecutionContext::cpu())?;
    let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu)?;
    let labels = Tensor::new(&[0u32, 2], &Device::Cpu)?;

    let logits = classifier.forward(&ids)?.logits;
    let loss = classification_loss(&logits, &labels)?.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss > 0.0);
    Ok(())
}
