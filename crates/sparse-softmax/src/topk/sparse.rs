use std::sync::Arc;

use candle_core::{DType, Result as CandleResult, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::checks::{check_inputs, check_weight, Projection};
use crate::core::{errors::to_backend_err, KernelConfig, KernelKind, SoftmaxError, SoftmaxKernel};
use crate::precision::{matmul_dtype, project};
use crate::sparse::SparseDistribution;
use crate::topk::top_k_last_dim;

/// Scratch budget shared by fused projection + top-k kernels.
///
/// Callers create one workspace and hand it to every kernel that should
/// share it; nothing is allocated lazily behind their back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopKWorkspace {
    temp_memory_bytes: usize,
}

impl TopKWorkspace {
    pub const DEFAULT_TEMP_MEMORY: usize = 10 * 1024 * 1024;

    pub fn new(temp_memory_bytes: usize) -> Self {
        Self { temp_memory_bytes }
    }

    pub fn temp_memory_bytes(&self) -> usize {
        self.temp_memory_bytes
    }

    /// Rows of `[rows, vocab]` logits that fit in the budget, at least one.
    pub fn rows_per_chunk(&self, vocab: usize, dtype: DType) -> usize {
        let row_bytes = vocab.saturating_mul(dtype.size_in_bytes()).max(1);
        (self.temp_memory_bytes / row_bytes).max(1)
    }
}

impl Default for TopKWorkspace {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TEMP_MEMORY)
    }
}

/// Row-chunked projection + top-k returning only the sparse support.
///
/// Tokens are processed in chunks sized by the [`TopKWorkspace`], so live
/// logits never exceed its budget. The label is not added to the support:
/// the output has exactly `k` columns per token, normalized over those.
#[derive(Debug, Clone)]
pub struct TopKSparseSoftmax {
    weight: Tensor,
    projection: Projection,
    k: usize,
    workspace: Arc<TopKWorkspace>,
}

impl TopKSparseSoftmax {
    pub fn with_workspace(
        weight: &Tensor,
        config: &KernelConfig,
        workspace: Arc<TopKWorkspace>,
    ) -> Result<Self, SoftmaxError> {
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
            "sparse_softmax::topk_sparse init hidden={} vocab={} dtype={:?} k={} temp_memory={}",
            projection.hidden,
            projection.vocab,
            projection.dtype,
            config.top_k,
            workspace.temp_memory_bytes()
        );
        Ok(Self {
            weight: weight.clone(),
            projection,
            k: config.top_k,
            workspace,
        })
    }

    pub fn workspace(&self) -> &Arc<TopKWorkspace> {
        &self.workspace
    }

    fn chunked_top_k(&self, activation: &Tensor, tokens: usize) -> CandleResult<(Tensor, Tensor)> {
        let logits_dtype = matmul_dtype(self.projection.dtype, self.weight.device());
        let rows = self
            .workspace
            .rows_per_chunk(self.projection.vocab, logits_dtype);
        let mut indices = Vec::with_capacity(tokens.div_ceil(rows));
        let mut probs = Vec::with_capacity(tokens.div_ceil(rows));
        let mut start = 0;
        while start < tokens {
            let len = rows.min(tokens - start);
            let logits = project(&activation.narrow(0, start, len)?, &self.weight)?;
            let (values, idx) = top_k_last_dim(&logits, self.k)?;
            probs.push(softmax_last_dim(&values.to_dtype(DType::F32)?)?);
            indices.push(idx);
            start += len;
        }
        log::debug!(
            "sparse_softmax::topk_sparse forward tokens={} chunks={} rows_per_chunk={}",
            tokens,
            indices.len(),
            rows
        );
        Ok((Tensor::cat(&indices, 0)?, Tensor::cat(&probs, 0)?))
    }
}

impl SoftmaxKernel for TopKSparseSoftmax {
    type Output = SparseDistribution;

    const KIND: KernelKind = KernelKind::TopKSparse;

    /// Builds with a private default-sized workspace.
    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError> {
        Self::with_workspace(weight, config, Arc::new(TopKWorkspace::default()))
    }

    fn forward(
        &self,
        activation: &Tensor,
        labels: &Tensor,
    ) -> Result<SparseDistribution, SoftmaxError> {
        let (tokens, _) = check_inputs(&self.projection, self.weight.device(), activation, labels)?;
        let (indices, probs) = self
            .chunked_top_k(activation, tokens)
            .map_err(to_backend_err)?;
        Ok(SparseDistribution::new(indices, probs, self.projection.vocab))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn chunk_size_follows_the_budget() {
        let workspace = TopKWorkspace::new(4096);
        assert_eq!(workspace.rows_per_chunk(256, DType::F32), 4);
        assert_eq!(workspace.rows_per_chunk(256, DType::F16), 8);
        assert_eq!(workspace.rows_per_chunk(1 << 20, DType::F32), 1);
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1.0, (8, 32), &device).unwrap();
        let activation = Tensor::randn(0f32, 1.0, (7, 8), &device).unwrap();
        let labels = Tensor::zeros(7, DType::U32, &device).unwrap();
        let config = KernelConfig::new(3, 1);

        // 256 bytes fit two rows of 32 f32 logits.
        let small = Arc::new(TopKWorkspace::new(256));
        let chunked = TopKSparseSoftmax::with_workspace(&weight, &config, small)
            .unwrap()
            .forward(&activation, &labels)
            .unwrap();
        let whole = TopKSparseSoftmax::build(&weight, &config)
            .unwrap()
            .forward(&activation, &labels)
            .unwrap();

        assert_eq!(chunked.support(), 3);
        assert_eq!(
            chunked.indices().to_vec2::<u32>().unwrap(),
            whole.indices().to_vec2::<u32>().unwrap()
        );
        for row in chunked.probs().to_vec2::<f32>().unwrap() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn kernels_can_share_one_workspace() {
        let device = Device::Cpu;
        let workspace = Arc::new(TopKWorkspace::default());
        let a = Tensor::zeros((4, 8), DType::F32, &device).unwrap();
        let b = Tensor::zeros((4, 16), DType::F32, &device).unwrap();
        let config = KernelConfig::new(2, 1);
        let first = TopKSparseSoftmax::with_workspace(&a, &config, workspace.clone()).unwrap();
        let second = TopKSparseSoftmax::with_workspace(&b, &config, workspace.clone()).unwrap();
        assert!(Arc::ptr_eq(first.workspace(), second.workspace()));
        assert_eq!(Arc::strong_count(&workspace), 3);
    }
}
