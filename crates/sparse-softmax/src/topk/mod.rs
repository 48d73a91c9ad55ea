//! Kernels that keep only the `k` largest logits per token, plus the label.

pub mod dense;
pub mod sparse;
pub mod tiled;

use candle_core::{Result as CandleResult, Tensor, D};

pub use dense::TopKSoftmax;
pub use sparse::{TopKSparseSoftmax, TopKWorkspace};
pub use tiled::TopKTiledSoftmax;

/// Largest `k` entries of every row, descending: `(values, u32 indices)`.
pub(crate) fn top_k_last_dim(x: &Tensor, k: usize) -> CandleResult<(Tensor, Tensor)> {
    let x = x.contiguous()?;
    let indices = x
        .arg_sort_last_dim(false)?
        .narrow(D::Minus1, 0, k)?
        .contiguous()?;
    let values = x.gather(&indices, D::Minus1)?;
    Ok((values, indices))
}
