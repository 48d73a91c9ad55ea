//! Softmax kernels for very large output vocabularies.
//!
//! Every kernel projects activations `[tokens, hidden]` through a weight
//! `[hidden, vocab]` and normalizes the result into `f32` probabilities. The
//! dense kernels in [`reference`] normalize over the whole vocabulary and
//! serve as ground truth. The kernels in [`topk`] keep only the `k` largest
//! logits of each token plus its label, which is what makes them cheap:
//! [`TopKTiledSoftmax`] never materializes more than one vocabulary tile of
//! logits, and [`TopKSparseSoftmax`] returns a [`SparseDistribution`] instead
//! of a dense `[tokens, vocab]` tensor.
//!
//! Kernels are chosen by the caller. [`KernelKind`] names each one for
//! configuration files and command lines.

pub mod core;
pub mod data;
pub mod reference;
pub mod sparse;
pub mod topk;

mod checks;
mod precision;

pub use crate::core::{KernelConfig, KernelKind, OutputFootprint, SoftmaxError, SoftmaxKernel};
pub use data::{sample_inputs, SampleInputs};
pub use reference::{BaselineSoftmax, InplaceSoftmax, TiledSoftmax};
pub use sparse::SparseDistribution;
pub use topk::{TopKSoftmax, TopKSparseSoftmax, TopKTiledSoftmax, TopKWorkspace};
