//! Random inputs for tests and benchmarks.

use candle_core::{DType, Device, Tensor};

use crate::checks::expect_dtype;
use crate::core::{errors::to_backend_err, SoftmaxError};

/// Activation, projection weight and labels for one kernel invocation.
#[derive(Debug, Clone)]
pub struct SampleInputs {
    /// `[tokens, hidden]`, uniform in `[0, 1)`.
    pub activation: Tensor,
    /// `[hidden, vocab]`, uniform in `[-1/sqrt(hidden), 1/sqrt(hidden))`.
    pub weight: Tensor,
    /// `[tokens]` `u32`, uniform over the vocabulary.
    pub labels: Tensor,
}

pub fn sample_inputs(
    tokens: usize,
    hidden: usize,
    vocab: usize,
    dtype: DType,
    device: &Device,
) -> Result<SampleInputs, SoftmaxError> {
    expect_dtype(dtype)?;
    if tokens == 0 || hidden == 0 || vocab == 0 {
        return Err(SoftmaxError::InvalidShape {
            context: format!("sample shape must be non-zero, got ({tokens}, {hidden}) x ({hidden}, {vocab})"),
        });
    }
    let bound = 1.0 / (hidden as f32).sqrt();
    let activation = Tensor::rand(0f32, 1.0, (tokens, hidden), device)
        .and_then(|t| t.to_dtype(dtype))
        .map_err(to_backend_err)?;
    let weight = Tensor::rand(-bound, bound, (hidden, vocab), device)
        .and_then(|t| t.to_dtype(dtype))
        .map_err(to_backend_err)?;
    let labels = Tensor::rand(0f32, vocab as f32, tokens, device)
        .and_then(|t| t.floor())
        .and_then(|t| t.clamp(0f32, (vocab - 1) as f32))
        .and_then(|t| t.to_dtype(DType::U32))
        .map_err(to_backend_err)?;
    Ok(SampleInputs {
        activation,
        weight,
        labels,
    })
}
