use std::path::PathBuf;

use candle_core::DType;
use thiserror::Error;

use crate::handle::HandleId;

pub type Result<T> = std::result::Result<T, OffloadError>;

/// Failures surfaced by offload handles, buffers and optimizers.
///
/// Every variant aborts the current training step. Nothing is retried and a
/// failed write is not rolled back.
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("invalid file binding: {0}")]
    InvalidBinding(String),

    #[error("handle {0} has no backing file bound")]
    NoFileBound(HandleId),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("handle {0} is not resident; materialize it from file first")]
    NotResident(HandleId),

    #[error("failed to allocate {bytes} bytes for offload buffer")]
    OutOfMemory { bytes: usize },

    #[error("offload buffer full: requested {requested} elements, {remaining} remaining")]
    BufferFull { requested: usize, remaining: usize },

    #[error("unsupported dtype {0:?} for offload storage")]
    UnsupportedDType(DType),

    #[error("handle {0} is not trainable")]
    NotTrainable(HandleId),

    #[error(
        "file region {}[{start}..{end}) overlaps an existing binding [{existing_start}..{existing_end})",
        path.display()
    )]
    OverlappingRegion {
        path: PathBuf,
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

impl OffloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch(message.into())
    }
}

impl From<toml::de::Error> for OffloadError {
    fn from(value: toml::de::Error) -> Self {
        OffloadError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for OffloadError {
    fn from(value: serde_json::Error) -> Self {
        OffloadError::ConfigFormat(value.to_string())
    }
}
