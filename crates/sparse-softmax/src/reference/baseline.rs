use candle_core::{DType, Result as CandleResult, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::checks::{check_inputs, check_weight, Projection};
use crate::core::{errors::to_backend_err, KernelConfig, KernelKind, SoftmaxError, SoftmaxKernel};
use crate::precision::project;

/// Full projection followed by a fused softmax over every vocabulary entry.
///
/// Peak memory is one `[tokens, vocab]` logits tensor plus the output. This
/// is the numerical ground truth the other kernels are tested against.
#[derive(Debug, Clone)]
pub struct BaselineSoftmax {
    weight: Tensor,
    projection: Projection,
}

impl SoftmaxKernel for BaselineSoftmax {
    type Output = Tensor;

    const KIND: KernelKind = KernelKind::Baseline;

    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError> {
        config.validate()?;
        let projection = check_weight(weight)?;
        log::info!(
            "sparse_softmax::baseline init hidden={} vocab={} dtype={:?}",
            projection.hidden,
            projection.vocab,
            projection.dtype
        );
        Ok(Self {
            weight: weight.clone(),
            projection,
        })
    }

    fn forward(&self, activation: &Tensor, labels: &Tensor) -> Result<Tensor, SoftmaxError> {
        check_inputs(&self.projection, self.weight.device(), activation, labels)?;
        dense_softmax(activation, &self.weight).map_err(to_backend_err)
    }
}

/// Projects in the input dtype (`bf16` is promoted on CPU) and normalizes in
/// `f32`.
pub(crate) fn dense_softmax(activation: &Tensor, weight: &Tensor) -> CandleResult<Tensor> {
    let logits = project(activation, weight)?.to_dtype(DType::F32)?;
    softmax_last_dim(&logits)
}
