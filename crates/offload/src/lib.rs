//! Disk-backed trainable tensors for large-model training on candle.
//!
//! An [`OffloadTensorHandle`] keeps its authoritative bytes in exactly one of a
//! private resident cache, a region of a shared [`OffloadBuffer`], or a
//! byte range of a header-less backing file. Moving between those places is
//! explicit and synchronous; nothing is prefetched or written behind the
//! caller's back.
//!
//! Optimizers see parameters only through [`TrainableOffloadOperand`], so the
//! same [`OffloadOptimizer`] updates plain in-memory tensors and evicted
//! handles alike. [`OffloadParameterStore`] ties the pieces together for one
//! rank: one file, one flat buffer, and a begin/end step protocol that decides
//! when parameters are staged in and written out.
//!
//! # Thread Safety
//!
//! Handles and buffers are `Send + Sync` but not internally synchronized.
//! Inserts into a buffer and transitions on a handle must be serialized by
//! the owner.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod errors;
pub mod handle;
pub mod operand;
pub mod optim;
pub mod registry;
pub mod store;

pub use buffer::{BufferRegion, OffloadBuffer, RegionRecord};
pub use config::{OffloadConfig, StorageDType};
pub use errors::{OffloadError, Result};
pub use handle::{FileBinding, HandleId, Location, OffloadTensorHandle};
pub use operand::{PlainParameter, TrainableOffloadOperand};
pub use optim::{AdamWConfig, OffloadOptimizer, OptimizerConfig, OptimizerOptions, SgdConfig};
pub use registry::FileRegionRegistry;
pub use store::{OffloadParameterStore, StepPhase};
