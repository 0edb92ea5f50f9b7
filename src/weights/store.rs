use std::collections::BTreeMap;
use std::sync::PoisonError;

use candle_core::{DType, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use safetensors::tensor::TensorView;
use safetensors::{Dtype as SafeDtype, SafeTensors};

use crate::context::ExecutionContext;
use crate::error::{Result, TransformerError};
use crate::model::{ClassifierConfig, DecoderStack, ModelConfig, SequenceClassifier};

/// Trainable weights of one model instance.
///
/// Wraps a [`VarMap`]: models read the variables during forward passes, and
/// only the external optimizer writes them between steps.
#[derive(Clone)]
pub struct ParameterStore {
    varmap: VarMap,
}

impl ParameterStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            varmap: VarMap::new(),
        }
    }

    /// Builder that creates (or reuses) variables in this store.
    #[must_use]
    pub fn var_builder(&self, ctx: &ExecutionContext) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, ctx.dtype(), ctx.device())
    }

    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// All trainable variables, e.g. for `candle_nn::AdamW::new`.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Sorted parameter names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Var> {
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
        data.get(name).cloned()
    }

    /// Overwrite one variable in place.
    ///
    /// # Errors
    /// Returns [`TransformerError::Weights`] if the name is unknown or the
    /// shape differs.
    pub fn set(&self, name: &str, value: &Tensor) -> Result<()> {
        let var = self
            .get(name)
            .ok_or_else(|| TransformerError::Weights(format!("unknown parameter {name:?}")))?;
        if var.dims() != value.dims() {
            return Err(TransformerError::Weights(format!(
                "parameter {name:?} has shape {:?}, got {:?}",
                var.dims(),
                value.dims()
            )));
        }
        var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
        Ok(())
    }

    /// Serialize every variable as f32 safetensors bytes.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be read or serialization fails.
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let mut raw: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for name in self.names() {
            let Some(var) = self.get(&name) else {
                continue;
            };
            let values = var
                .as_tensor()
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            raw.push((name, var.dims().to_vec(), bytes));
        }

        let mut tensors: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
        for (name, shape, bytes) in &raw {
            let view = TensorView::new(SafeDtype::F32, shape.clone(), bytes)?;
            tensors.insert(name.clone(), view);
        }
        Ok(safetensors::serialize(tensors.iter(), None)?)
    }

    /// Restore every variable of this store from safetensors bytes.
    ///
    /// Extra tensors in the buffer are ignored.
    ///
    /// # Errors
    /// Returns [`TransformerError::Weights`] if a variable is missing, is not
    /// f32, or has a different shape.
    pub fn load_safetensors_bytes(&self, data: &[u8]) -> Result<()> {
        let safetensors = SafeTensors::deserialize(data)?;
        for name in self.names() {
            let view = safetensors
                .tensor(&name)
                .map_err(|_| TransformerError::Weights(format!("missing tensor {name:?}")))?;
            if view.dtype() != SafeDtype::F32 {
                return Err(TransformerError::Weights(format!(
                    "tensor {name:?} has dtype {:?}, expected F32",
                    view.dtype()
                )));
            }
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let Some(var) = self.get(&name) else {
                continue;
            };
            let tensor = Tensor::from_vec(values, view.shape(), var.device())?;
            self.set(&name, &tensor)?;
        }
        log::debug!("restored {} parameter tensors", self.names().len());
        Ok(())
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a decoder stack with freshly initialised trainable weights.
///
/// # Errors
/// Returns an error if the config is invalid or weight creation fails.
pub fn init_language_model(
    config: ModelConfig,
    ctx: &ExecutionContext,
) -> Result<(DecoderStack, ParameterStore)> {
    let store = ParameterStore::new();
    let model = DecoderStack::new(config, store.var_builder(ctx), ctx)?;
    log::debug!("language model parameters: {}", store.num_parameters());
    Ok((model, store))
}

/// Build a sequence classifier with freshly initialised trainable weights.
///
/// # Errors
/// Returns an error if the config is invalid or weight creation fails.
pub fn init_classifier(
    config: ClassifierConfig,
    ctx: &ExecutionContext,
) -> Result<(SequenceClassifier, ParameterStore)> {
    let store = ParameterStore::new();
    let model = SequenceClassifier::new(config, store.var_builder(ctx), ctx)?;
    log::debug!("classifier parameters: {}", store.num_parameters());
    Ok((model, store))
}
