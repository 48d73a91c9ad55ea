//! Dense kernels that normalize over every vocabulary entry.
//!
//! These paths favour clarity over memory and serve as the numerical baseline
//! for the top-k kernels.

pub mod baseline;
pub mod inplace;
pub mod tiled;

pub use baseline::BaselineSoftmax;
pub use inplace::InplaceSoftmax;
pub use tiled::TiledSoftmax;
