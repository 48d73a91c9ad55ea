//! Core traits and types shared across softmax kernels.
//!
//! Every kernel is built once from a projection weight laid out as
//! `[hidden, vocab]` and then invoked on activations `[tokens, hidden]` with
//! labels `[tokens]`. Whatever the input dtype (`f32`, `f16` or `bf16`),
//! probabilities are always produced in `f32`.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{KernelConfig, KernelKind};
pub use errors::SoftmaxError;

use crate::sparse::SparseDistribution;

/// Unified interface for the softmax kernel family.
///
/// * `weight` is `[hidden, vocab]` and is captured at build time.
/// * `activation` is `[tokens, hidden]` with the weight's dtype and device.
/// * `labels` is `[tokens]` (`u32` or `i64`), each in `[0, vocab)`.
/// * Dense outputs are `[tokens, vocab]` `f32` with rows summing to one.
pub trait SoftmaxKernel: Sized {
    /// Dense tensor, tile list or sparse distribution depending on the kernel.
    type Output: OutputFootprint;

    const KIND: KernelKind;

    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError>;

    fn forward(&self, activation: &Tensor, labels: &Tensor) -> Result<Self::Output, SoftmaxError>;
}

/// Bytes held by a kernel output, used for rough peak-memory reporting.
pub trait OutputFootprint {
    fn footprint_bytes(&self) -> usize;
}

impl OutputFootprint for Tensor {
    fn footprint_bytes(&self) -> usize {
        self.elem_count() * self.dtype().size_in_bytes()
    }
}

impl OutputFootprint for Vec<Tensor> {
    fn footprint_bytes(&self) -> usize {
        self.iter().map(OutputFootprint::footprint_bytes).sum()
    }
}

impl OutputFootprint for SparseDistribution {
    fn footprint_bytes(&self) -> usize {
        self.indices().footprint_bytes() + self.probs().footprint_bytes()
    }
}
