//! Row-sparse probability distributions over a vocabulary.

use candle_core::{DType, Tensor};

use crate::core::{errors::to_backend_err, SoftmaxError};

/// Per-row support and probabilities.
///
/// `indices` is `u32 [tokens, support]`, `probs` is `f32 [tokens, support]`.
/// A column may carry probability zero; that is how a label that already sits
/// in the top-k support is kept out of the distribution a second time.
#[derive(Debug, Clone)]
pub struct SparseDistribution {
    indices: Tensor,
    probs: Tensor,
    vocab: usize,
}

impl SparseDistribution {
    pub(crate) fn new(indices: Tensor, probs: Tensor, vocab: usize) -> Self {
        Self {
            indices,
            probs,
            vocab,
        }
    }

    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    pub fn probs(&self) -> &Tensor {
        &self.probs
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    pub fn tokens(&self) -> usize {
        self.indices.dims()[0]
    }

    /// Number of stored columns per row.
    pub fn support(&self) -> usize {
        self.indices.dims()[1]
    }

    /// Scatters the distribution into a dense `[tokens, vocab]` `f32` tensor.
    pub fn to_dense(&self) -> Result<Tensor, SoftmaxError> {
        Tensor::zeros((self.tokens(), self.vocab), DType::F32, self.probs.device())
            .and_then(|dense| dense.scatter_add(&self.indices, &self.probs, 1))
            .map_err(to_backend_err)
    }

    /// Strictly positive entries per row.
    pub fn nnz_per_row(&self) -> Result<Vec<usize>, SoftmaxError> {
        let rows = self.probs.to_vec2::<f32>().map_err(to_backend_err)?;
        Ok(rows
            .iter()
            .map(|row| row.iter().filter(|&&p| p > 0.0).count())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn dense_view_places_probabilities() {
        let device = Device::Cpu;
        let indices = Tensor::new(&[[2u32, 0, 2], [1, 3, 0]], &device).unwrap();
        let probs = Tensor::new(&[[0.75f32, 0.25, 0.0], [0.5, 0.5, 0.0]], &device).unwrap();
        let dist = SparseDistribution::new(indices, probs, 4);

        assert_eq!((dist.tokens(), dist.support()), (2, 3));
        assert_eq!(
            dist.to_dense().unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![0.25, 0.0, 0.75, 0.0], vec![0.0, 0.5, 0.0, 0.5]]
        );
        assert_eq!(dist.nnz_per_row().unwrap(), vec![2, 2]);
    }
}
