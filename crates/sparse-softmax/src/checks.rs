//! Validation helpers shared by every kernel's build and forward paths.

use candle_core::{DType, Device, Tensor};

use crate::core::{errors::to_backend_err, SoftmaxError};

pub(crate) const SUPPORTED_DTYPES: [DType; 3] = [DType::F32, DType::F16, DType::BF16];

/// Projection shape captured at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Projection {
    pub hidden: usize,
    pub vocab: usize,
    pub dtype: DType,
}

/// Checks the `[hidden, vocab]` layout and a supported dtype.
pub(crate) fn check_weight(weight: &Tensor) -> Result<Projection, SoftmaxError> {
    let (hidden, vocab) = weight.dims2().map_err(|_| SoftmaxError::InvalidShape {
        context: format!("weight must be [hidden, vocab], got {:?}", weight.dims()),
    })?;
    if hidden == 0 || vocab == 0 {
        return Err(SoftmaxError::InvalidShape {
            context: format!("weight dimensions must be non-zero, got [{hidden}, {vocab}]"),
        });
    }
    expect_dtype(weight.dtype())?;
    Ok(Projection {
        hidden,
        vocab,
        dtype: weight.dtype(),
    })
}

pub(crate) fn expect_dtype(dtype: DType) -> Result<(), SoftmaxError> {
    if SUPPORTED_DTYPES.contains(&dtype) {
        Ok(())
    } else {
        Err(SoftmaxError::UnsupportedDType {
            requested: format!("{dtype:?}, expected one of {SUPPORTED_DTYPES:?}"),
        })
    }
}

/// Validates a forward call and returns `(tokens, labels as u32)`.
pub(crate) fn check_inputs(
    projection: &Projection,
    device: &Device,
    activation: &Tensor,
    labels: &Tensor,
) -> Result<(usize, Tensor), SoftmaxError> {
    let (tokens, hidden) = activation.dims2().map_err(|_| SoftmaxError::InvalidShape {
        context: format!(
            "activation must be [tokens, hidden], got {:?}",
            activation.dims()
        ),
    })?;
    if tokens == 0 {
        return Err(SoftmaxError::InvalidShape {
            context: "activation must contain at least one token".to_string(),
        });
    }
    if hidden != projection.hidden {
        return Err(SoftmaxError::InvalidShape {
            context: format!(
                "activation hidden size {hidden} does not match weight hidden size {}",
                projection.hidden
            ),
        });
    }
    if activation.dtype() != projection.dtype {
        return Err(SoftmaxError::InvalidShape {
            context: format!(
                "activation dtype {:?} must match weight dtype {:?}",
                activation.dtype(),
                projection.dtype
            ),
        });
    }
    if !activation.device().same_device(device) || !labels.device().same_device(device) {
        return Err(SoftmaxError::InvalidShape {
            context: "activation, labels and weight must reside on the same device".to_string(),
        });
    }
    let labels = labels_to_u32(labels, tokens, projection.vocab)?;
    Ok((tokens, labels))
}

fn labels_to_u32(labels: &Tensor, tokens: usize, vocab: usize) -> Result<Tensor, SoftmaxError> {
    if labels.dims() != [tokens] {
        return Err(SoftmaxError::InvalidShape {
            context: format!("labels must be [{tokens}], got {:?}", labels.dims()),
        });
    }
    let values: Vec<u32> = match labels.dtype() {
        DType::U32 => labels.to_vec1::<u32>().map_err(to_backend_err)?,
        DType::U8 => labels
            .to_vec1::<u8>()
            .map_err(to_backend_err)?
            .into_iter()
            .map(u32::from)
            .collect(),
        DType::I64 => labels
            .to_vec1::<i64>()
            .map_err(to_backend_err)?
            .into_iter()
            .enumerate()
            .map(|(row, label)| {
                u32::try_from(label).map_err(|_| SoftmaxError::InvalidTarget {
                    context: format!("label {label} at row {row} is outside [0, {vocab})"),
                })
            })
            .collect::<Result<_, _>>()?,
        other => {
            return Err(SoftmaxError::InvalidTarget {
                context: format!("labels must be u8, u32 or i64, got {other:?}"),
            })
        }
    };
    if let Some((row, label)) = values
        .iter()
        .enumerate()
        .find(|(_, label)| **label as usize >= vocab)
    {
        return Err(SoftmaxError::InvalidTarget {
            context: format!("label {label} at row {row} is outside [0, {vocab})"),
        });
    }
    Tensor::from_vec(values, tokens, labels.device()).map_err(to_backend_err)
}
