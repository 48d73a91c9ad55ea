//! Configuration shared by all softmax kernels.
//!
//! Dense kernels ignore `top_k`; kernels that do not tile ignore
//! `tile_factor`. Both are still validated so a config can be swapped between
//! kernels without surprises.

use std::{fmt, str::FromStr};

use serde::Deserialize;

use super::errors::SoftmaxError;

pub const DEFAULT_TOP_K: usize = 200;
pub const DEFAULT_TILE_FACTOR: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KernelConfig {
    /// Number of vocabulary entries kept per token, label excluded.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Number of tiles the tiled dimension is split into.
    #[serde(default = "default_tile_factor")]
    pub tile_factor: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            tile_factor: DEFAULT_TILE_FACTOR,
        }
    }
}

impl KernelConfig {
    pub fn new(top_k: usize, tile_factor: usize) -> Self {
        Self { top_k, tile_factor }
    }

    pub fn validate(&self) -> Result<(), SoftmaxError> {
        if self.top_k == 0 {
            return Err(SoftmaxError::InvalidTileConfig {
                context: "top_k must be greater than 0".to_string(),
            });
        }
        if self.tile_factor == 0 {
            return Err(SoftmaxError::InvalidTileConfig {
                context: "tile_factor must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_tile_factor() -> usize {
    DEFAULT_TILE_FACTOR
}

/// Names every kernel in the family so callers can pick one at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Baseline,
    Inplace,
    Tiled,
    TopK,
    TopKTiled,
    TopKSparse,
}

impl KernelKind {
    pub const ALL: [KernelKind; 6] = [
        KernelKind::Baseline,
        KernelKind::Inplace,
        KernelKind::Tiled,
        KernelKind::TopK,
        KernelKind::TopKTiled,
        KernelKind::TopKSparse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KernelKind::Baseline => "baseline",
            KernelKind::Inplace => "inplace",
            KernelKind::Tiled => "tiled",
            KernelKind::TopK => "topk",
            KernelKind::TopKTiled => "topk-tiled",
            KernelKind::TopKSparse => "topk-sparse",
        }
    }

    /// Whether the output keeps only a top-k support per row.
    pub fn is_sparse(self) -> bool {
        matches!(
            self,
            KernelKind::TopK | KernelKind::TopKTiled | KernelKind::TopKSparse
        )
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "baseline" | "dense" => Ok(KernelKind::Baseline),
            "inplace" | "in-place" => Ok(KernelKind::Inplace),
            "tiled" => Ok(KernelKind::Tiled),
            "topk" | "top-k" => Ok(KernelKind::TopK),
            "topk-tiled" | "top-k-tiled" => Ok(KernelKind::TopKTiled),
            "topk-sparse" | "top-k-sparse" => Ok(KernelKind::TopKSparse),
            other => Err(format!(
                "unknown kernel '{other}', expected one of: {}",
                KernelKind::ALL.map(KernelKind::name).join(", ")
            )),
        }
    }
}
