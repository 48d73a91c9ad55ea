//! Error types emitted by softmax kernels.

/// Softmax-kernel error category.
#[derive(Debug)]
pub enum SoftmaxError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    UnsupportedDType { requested: String },
    /// `top_k` / `tile_factor` do not fit the projection weight.
    InvalidTileConfig { context: String },
    /// A label is out of range or has an unusable dtype.
    InvalidTarget { context: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for SoftmaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SoftmaxError::InvalidShape { context } => {
                write!(f, "invalid tensor shape: {context}")
            }
            SoftmaxError::UnsupportedDType { requested } => {
                write!(f, "unsupported dtype {requested}")
            }
            SoftmaxError::InvalidTileConfig { context } => {
                write!(f, "invalid tile configuration: {context}")
            }
            SoftmaxError::InvalidTarget { context } => write!(f, "invalid target: {context}"),
            SoftmaxError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for SoftmaxError {}

pub(crate) fn to_backend_err(err: candle_core::Error) -> SoftmaxError {
    SoftmaxError::Backend {
        message: err.to_string(),
    }
}
