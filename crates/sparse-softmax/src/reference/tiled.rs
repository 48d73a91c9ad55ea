use candle_core::Tensor;

use crate::checks::{check_inputs, check_weight, Projection};
use crate::core::{errors::to_backend_err, KernelConfig, KernelKind, SoftmaxError, SoftmaxKernel};
use crate::reference::baseline::dense_softmax;

/// Dense softmax computed over token tiles.
///
/// Tokens are split into chunks of `tokens / tile_factor` rows (at least one,
/// the last chunk may be shorter) and each chunk is projected and normalized
/// on its own. Use [`forward_tiles`](Self::forward_tiles) to keep the chunks
/// apart; [`forward`](SoftmaxKernel::forward) concatenates them, which brings
/// peak memory back to the dense baseline.
#[derive(Debug, Clone)]
pub struct TiledSoftmax {
    weight: Tensor,
    projection: Projection,
    tile_factor: usize,
}

impl TiledSoftmax {
    pub fn tile_factor(&self) -> usize {
        self.tile_factor
    }

    /// Per-tile probabilities `[rows_i, vocab]`, in token order.
    pub fn forward_tiles(
        &self,
        activation: &Tensor,
        labels: &Tensor,
    ) -> Result<Vec<Tensor>, SoftmaxError> {
        let (tokens, _) = check_inputs(&self.projection, self.weight.device(), activation, labels)?;
        let rows = (tokens / self.tile_factor).max(1);
        let mut tiles = Vec::with_capacity(tokens.div_ceil(rows));
        let mut start = 0;
        while start < tokens {
            let len = rows.min(tokens - start);
            let chunk = activation.narrow(0, start, len).map_err(to_backend_err)?;
            tiles.push(dense_softmax(&chunk, &self.weight).map_err(to_backend_err)?);
            start += len;
        }
        log::debug!(
            "sparse_softmax::tiled forward tokens={} tiles={} rows_per_tile={}",
            tokens,
            tiles.len(),
            rows
        );
        Ok(tiles)
    }
}

impl SoftmaxKernel for TiledSoftmax {
    type Output = Tensor;

    const KIND: KernelKind = KernelKind::Tiled;

    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError> {
        config.validate()?;
        let projection = check_weight(weight)?;
        log::info!(
            "sparse_softmax::tiled init hidden={} vocab={} dtype={:?} tile_factor={}",
            projection.hidden,
            projection.vocab,
            projection.dtype,
            config.tile_factor
        );
        Ok(Self {
            weight: weight.clone(),
            projection,
            tile_factor: config.tile_factor,
        })
    }

    fn forward(&self, activation: &Tensor, labels: &Tensor) -> Result<Tensor, SoftmaxError> {
        let tiles = self.forward_tiles(activation, labels)?;
        Tensor::cat(&tiles, 0).map_err(to_backend_err)
    }
}
