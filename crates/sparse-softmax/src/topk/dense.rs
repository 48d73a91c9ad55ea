use candle_core::{DType, Result as CandleResult, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::checks::{check_inputs, check_weight, Projection};
use crate::core::{errors::to_backend_err, KernelConfig, KernelKind, SoftmaxError, SoftmaxKernel};
use crate::precision::project;
use crate::topk::top_k_last_dim;

/// Top-k softmax on the full `[tokens, vocab]` logits.
///
/// Everything outside the top-k entries and the label is masked to `-inf`
/// before a dense softmax. Peak memory is higher than the baseline because
/// the mask is as large as the logits; the kernel exists as the untiled
/// reference for [`TopKTiledSoftmax`](crate::topk::TopKTiledSoftmax).
#[derive(Debug, Clone)]
pub struct TopKSoftmax {
    weight: Tensor,
    projection: Projection,
    k: usize,
}

impl TopKSoftmax {
    pub fn k(&self) -> usize {
        self.k
    }
}

impl SoftmaxKernel for TopKSoftmax {
    type Output = Tensor;

    const KIND: KernelKind = KernelKind::TopK;

    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError> {
        config.validate()?;
        let projection = check_weight(weight)?;
        if config.top_k > projection.vocab {
            return Err(SoftmaxError::InvalidTileConfig {
                context: format!(
                    "top_k {} exceeds vocabulary size {}",
                    config.top_k, projection.vocab
                ),
            });
        }
        log::info!(
            "sparse_softmax::topk init hidden={} vocab={} dtype={:?} k={}",
            projection.hidden,
            projection.vocab,
            projection.dtype,
            config.top_k
        );
        Ok(Self {
            weight: weight.clone(),
            projection,
            k: config.top_k,
        })
    }

    fn forward(&self, activation: &Tensor, labels: &Tensor) -> Result<Tensor, SoftmaxError> {
        let (tokens, labels) =
            check_inputs(&self.projection, self.weight.device(), activation, labels)?;
        self.masked_softmax(activation, &labels, tokens)
            .map_err(to_backend_err)
    }
}

impl TopKSoftmax {
    fn masked_softmax(
        &self,
        activation: &Tensor,
        labels: &Tensor,
        tokens: usize,
    ) -> CandleResult<Tensor> {
        let vocab = self.projection.vocab;
        let device = activation.device();
        let logits = project(activation, &self.weight)?.to_dtype(DType::F32)?;
        let (_, top_idx) = top_k_last_dim(&logits, self.k)?;

        // Support = top-k columns plus the label; a label already in the
        // top-k only bumps a counter, so it is kept once.
        let support = Tensor::cat(&[&top_idx, &labels.reshape((tokens, 1))?], 1)?;
        let hits = Tensor::zeros((tokens, vocab), DType::U32, device)?.scatter_add(
            &support,
            &Tensor::ones((tokens, self.k + 1), DType::U32, device)?,
            1,
        )?;
        let masked_out = Tensor::full(f32::NEG_INFINITY, (tokens, vocab), device)?;
        let masked = hits.where_cond(&logits, &masked_out)?;
        softmax_last_dim(&masked)
    }
}
