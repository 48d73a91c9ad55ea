//! Dtype used for the projection matmul.
//!
//! Projections run in the input dtype, except where the backend has no
//! matmul for it: the CPU backend lacks a `bf16` gemm, so `bf16` operands are
//! promoted to `f32` there. Normalization is always `f32` and is handled by
//! the kernels themselves.

use candle_core::{DType, Device, Result as CandleResult, Tensor};

/// Dtype `activation.matmul(weight)` is evaluated in for `dtype` on `device`.
pub(crate) fn matmul_dtype(dtype: DType, device: &Device) -> DType {
    match dtype {
        DType::BF16 if device.is_cpu() => DType::F32,
        other => other,
    }
}

/// `activation [rows, hidden] x weight [hidden, cols]`, promoted per
/// [`matmul_dtype`]. The result is in the matmul dtype.
pub(crate) fn project(activation: &Tensor, weight: &Tensor) -> CandleResult<Tensor> {
    let compute = matmul_dtype(weight.dtype(), weight.device());
    if compute == weight.dtype() {
        activation.matmul(weight)
    } else {
        activation
            .to_dtype(compute)?
            .matmul(&weight.to_dtype(compute)?)
    }
}
