//! Opt-in bookkeeping of file byte ranges.
//!
//! Handles themselves accept any binding. Code that hands out bindings for
//! many handles (the parameter store, tests) can claim every range here first
//! and get [`OffloadError::OverlappingRegion`] instead of silent corruption.

use std::{
    collections::HashMap,
    ops::Range,
    path::{Path, PathBuf},
};

use crate::{
    errors::{OffloadError, Result},
    handle::OffloadTensorHandle,
};

#[derive(Debug, Default)]
pub struct FileRegionRegistry {
    // Per file, claimed ranges sorted by start.
    claims: HashMap<PathBuf, Vec<Range<u64>>>,
}

impl FileRegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `[offset, offset + len)` of `path`. Empty ranges always succeed.
    pub fn claim(&mut self, path: impl AsRef<Path>, offset: u64, len: u64) -> Result<()> {
        let path = path.as_ref();
        let end = offset.checked_add(len).ok_or_else(|| {
            OffloadError::InvalidBinding(format!("region {offset}+{len} overflows u64"))
        })?;
        if len == 0 {
            return Ok(());
        }

        let ranges = self.claims.entry(path.to_path_buf()).or_default();
        let idx = ranges.partition_point(|range| range.start < offset);
        let neighbours = idx
            .checked_sub(1)
            .map(|prev| &ranges[prev])
            .into_iter()
            .chain(ranges.get(idx));
        for existing in neighbours {
            if existing.start < end && offset < existing.end {
                return Err(OffloadError::OverlappingRegion {
                    path: path.to_path_buf(),
                    start: offset,
                    end,
                    existing_start: existing.start,
                    existing_end: existing.end,
                });
            }
        }
        ranges.insert(idx, offset..end);
        Ok(())
    }

    /// Claims the region a handle is currently bound to.
    pub fn claim_handle(&mut self, handle: &OffloadTensorHandle) -> Result<()> {
        let binding = handle
            .file_binding()
            .ok_or(OffloadError::NoFileBound(handle.id()))?;
        self.claim(&binding.path, binding.offset, binding.len)
    }

    /// Returns whether a range starting at `offset` was claimed for `path`.
    pub fn release(&mut self, path: impl AsRef<Path>, offset: u64) -> bool {
        let Some(ranges) = self.claims.get_mut(path.as_ref()) else {
            return false;
        };
        match ranges.binary_search_by_key(&offset, |range| range.start) {
            Ok(idx) => {
                ranges.remove(idx);
                true
            }
            Err(_) => false,
        }
    }
}
