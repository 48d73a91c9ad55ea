//! Vocabulary-tiled top-k softmax.
//!
//! The `[hidden, vocab]` weight is cut into column tiles of
//! `vocab / tile_factor` entries (the last tile takes the remainder). Each
//! tile is projected on its own and reduced to its `k` best logits, so the
//! largest live logits tensor is `[tokens, vocab / tile_factor]` instead of
//! `[tokens, vocab]`. A second top-k over the `tiles * k` survivors yields
//! the global top-k: every member of the global top-k is necessarily in the
//! top-k of its own tile.
//!
//! The label logit is computed separately with one dot product per token and
//! joins the support unless it is already there. Projections stay in the
//! input dtype (`bf16` is promoted on CPU, see [`crate::precision`]);
//! normalization runs in `f32` over the `k + 1` support columns.

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::checks::{check_inputs, check_weight, Projection};
use crate::core::{errors::to_backend_err, KernelConfig, KernelKind, SoftmaxError, SoftmaxKernel};
use crate::precision::project;
use crate::sparse::SparseDistribution;
use crate::topk::top_k_last_dim;

#[derive(Debug, Clone)]
struct WeightTile {
    offset: usize,
    weight: Tensor,
}

#[derive(Debug, Clone)]
pub struct TopKTiledSoftmax {
    weight: Tensor,
    tiles: Vec<WeightTile>,
    projection: Projection,
    k: usize,
}

impl TopKTiledSoftmax {
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// `(offset, width)` of every column tile.
    pub fn tile_bounds(&self) -> Vec<(usize, usize)> {
        self.tiles
            .iter()
            .map(|tile| (tile.offset, tile.weight.dims()[1]))
            .collect()
    }

    /// Support of `k + 1` columns per token.
    ///
    /// The last column holds the label. When the label is already part of the
    /// top-k its extra column carries probability zero.
    pub fn forward_sparse(
        &self,
        activation: &Tensor,
        labels: &Tensor,
    ) -> Result<SparseDistribution, SoftmaxError> {
        let (tokens, labels) =
            check_inputs(&self.projection, self.weight.device(), activation, labels)?;
        let (indices, probs) = self
            .sparse_support(activation, &labels, tokens)
            .map_err(to_backend_err)?;
        Ok(SparseDistribution::new(indices, probs, self.projection.vocab))
    }

    fn sparse_support(
        &self,
        activation: &Tensor,
        labels: &Tensor,
        tokens: usize,
    ) -> CandleResult<(Tensor, Tensor)> {
        let device = activation.device();

        let mut values = Vec::with_capacity(self.tiles.len());
        let mut indices = Vec::with_capacity(self.tiles.len());
        for tile in &self.tiles {
            let logits = project(activation, &tile.weight)?;
            let (tile_values, tile_idx) = top_k_last_dim(&logits, self.k)?;
            let offset = Tensor::new(tile.offset as u32, device)?;
            values.push(tile_values.to_dtype(DType::F32)?);
            indices.push(tile_idx.broadcast_add(&offset)?);
        }
        let values = Tensor::cat(&values, 1)?;
        let indices = Tensor::cat(&indices, 1)?;

        let (top_values, order) = top_k_last_dim(&values, self.k)?;
        let top_idx = indices.gather(&order, D::Minus1)?;

        let labels = labels.reshape((tokens, 1))?;
        let label_logit = self.label_logits(activation, &labels)?;
        let duplicate = top_idx.broadcast_eq(&labels)?.max_keepdim(1)?;
        let masked_out = Tensor::full(f32::NEG_INFINITY, (tokens, 1), device)?;
        let label_logit = duplicate.where_cond(&masked_out, &label_logit)?;

        let support_values = Tensor::cat(&[&top_values, &label_logit], 1)?;
        let support_idx = Tensor::cat(&[&top_idx, &labels], 1)?;
        let probs = softmax_last_dim(&support_values)?;
        Ok((support_idx, probs))
    }

    /// `activation[t] . weight[:, labels[t]]` computed in the input dtype,
    /// returned as `f32` `[tokens, 1]`.
    fn label_logits(&self, activation: &Tensor, labels: &Tensor) -> CandleResult<Tensor> {
        let columns = self.weight.index_select(&labels.flatten_all()?, 1)?.t()?;
        activation
            .mul(&columns)?
            .sum_keepdim(1)?
            .to_dtype(DType::F32)
    }
}

impl SoftmaxKernel for TopKTiledSoftmax {
    type Output = Tensor;

    const KIND: KernelKind = KernelKind::TopKTiled;

    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError> {
        config.validate()?;
        let projection = check_weight(weight)?;
        let vocab = projection.vocab;
        let width = vocab / config.tile_factor;
        if width == 0 {
            return Err(SoftmaxError::InvalidTileConfig {
                context: format!(
                    "tile_factor {} leaves empty tiles for vocabulary size {vocab}",
                    config.tile_factor
                ),
            });
        }

        let mut tiles = Vec::with_capacity(vocab.div_ceil(width));
        let mut offset = 0;
        while offset < vocab {
            let len = width.min(vocab - offset);
            if config.top_k > len {
                return Err(SoftmaxError::InvalidTileConfig {
                    context: format!(
                        "top_k {} exceeds width {len} of the tile at column {offset}",
                        config.top_k
                    ),
                });
            }
            let tile = weight
                .narrow(1, offset, len)
                .and_then(|tile| tile.contiguous())
                .map_err(to_backend_err)?;
            tiles.push(WeightTile {
                offset,
                weight: tile,
            });
            offset += len;
        }

        log::info!(
            "sparse_softmax::topk_tiled init hidden={} vocab={} dtype={:?} k={} tiles={} tile_width={}",
            projection.hidden,
            vocab,
            projection.dtype,
            config.top_k,
            tiles.len(),
            width
        );
        Ok(Self {
            weight: weight.clone(),
            tiles,
            projection,
            k: config.top_k,
        })
    }

    fn forward(&self, activation: &Tensor, labels: &Tensor) -> Result<Tensor, SoftmaxError> {
        self.forward_sparse(activation, labels)?.to_dense()
    }
}
