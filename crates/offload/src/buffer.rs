//! Flat offload buffers.
//!
//! An [`OffloadBuffer`] owns one contiguous 1-D tensor and hands out
//! non-overlapping element ranges to handles, bump-allocator style. Regions are
//! assigned in insertion order, never move and are never reclaimed; the
//! buffer is sized once per rank when the model is wrapped.
//!
//! Handles keep a [`BufferRegion`], a view onto the shared storage. Writes
//! through a region go straight into the buffer's storage so every view of
//! that range, including the ones returned by [`OffloadBuffer::get_tensors`],
//! observes them.

use std::collections::HashMap;

use candle_core::{DType, Device, Shape, Tensor, WithDType};
use half::{bf16, f16};

use crate::{
    errors::{OffloadError, Result},
    handle::{HandleId, OffloadTensorHandle},
};

/// Element range `[offset, offset + len)` of a buffer's storage.
#[derive(Debug, Clone)]
pub struct BufferRegion {
    storage: Tensor,
    offset: usize,
    len: usize,
}

impl BufferRegion {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shares storage with the buffer, no copy.
    pub fn view(&self, shape: &Shape) -> Result<Tensor> {
        Ok(self
            .storage
            .narrow(0, self.offset, self.len)?
            .reshape(shape.dims())?)
    }

    /// Copies `value` into the region. `value` must not alias the buffer.
    pub fn write(&self, value: &Tensor) -> Result<()> {
        if value.elem_count() != self.len {
            return Err(OffloadError::shape_mismatch(format!(
                "region holds {} elements, value has {}",
                self.len,
                value.elem_count()
            )));
        }
        let flat = value.flatten_all()?;
        self.storage.slice_set(&flat, 0, self.offset)?;
        Ok(())
    }
}

/// Placement of one handle inside the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRecord {
    pub handle: HandleId,
    pub offset: usize,
    pub len: usize,
    pub shape: Vec<usize>,
}

#[derive(Debug)]
pub struct OffloadBuffer {
    storage: Tensor,
    dtype: DType,
    capacity: usize,
    cursor: usize,
    regions: Vec<RegionRecord>,
    by_handle: HashMap<HandleId, usize>,
}

impl OffloadBuffer {
    /// Reserves `capacity` zeroed elements of `dtype` on `device`.
    pub fn allocate(capacity: usize, dtype: DType, device: &Device) -> Result<Self> {
        if capacity == 0 {
            return Err(OffloadError::Validation(vec![
                "offload buffer capacity must be greater than zero".to_string(),
            ]));
        }
        let storage = match dtype {
            DType::U8 => try_zeroed::<u8>(capacity, device)?,
            DType::U32 => try_zeroed::<u32>(capacity, device)?,
            DType::I64 => try_zeroed::<i64>(capacity, device)?,
            DType::BF16 => try_zeroed::<bf16>(capacity, device)?,
            DType::F16 => try_zeroed::<f16>(capacity, device)?,
            DType::F32 => try_zeroed::<f32>(capacity, device)?,
            DType::F64 => try_zeroed::<f64>(capacity, device)?,
            #[allow(unreachable_patterns)]
            other => return Err(OffloadError::UnsupportedDType(other)),
        };
        log::info!(
            "offload buffer init: capacity={} dtype={:?} device={:?} bytes={}",
            capacity,
            dtype,
            device.location(),
            capacity * dtype.size_in_bytes()
        );
        Ok(Self {
            storage,
            dtype,
            capacity,
            cursor: 0,
            regions: Vec::new(),
            by_handle: HashMap::new(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        self.storage.device()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements handed out so far.
    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[RegionRecord] {
        &self.regions
    }

    pub fn region_of(&self, handle: HandleId) -> Option<&RegionRecord> {
        self.by_handle.get(&handle).map(|&idx| &self.regions[idx])
    }

    /// Copies the handle's value to the end of the buffer and repoints the
    /// handle at that region.
    ///
    /// The handle must be resident. Its dirty flag carries over, since the
    /// bytes are unchanged by the move.
    pub fn insert(&mut self, handle: &mut OffloadTensorHandle) -> Result<RegionRecord> {
        if self.by_handle.contains_key(&handle.id()) {
            return Err(OffloadError::InvalidBinding(format!(
                "handle {} already occupies a buffer region",
                handle.id()
            )));
        }
        if handle.dtype() != self.dtype {
            return Err(OffloadError::shape_mismatch(format!(
                "buffer dtype {:?} does not match handle {} dtype {:?}",
                self.dtype,
                handle.id(),
                handle.dtype()
            )));
        }
        let len = handle.numel();
        let remaining = self.remaining();
        if len > remaining {
            return Err(OffloadError::BufferFull {
                requested: len,
                remaining,
            });
        }

        let value = handle.read_as_value()?.detach();
        let offset = self.cursor;
        let region = self.region(offset, len)?;
        region.write(&value)?;
        let dirty = handle.is_dirty();
        handle.adopt_region(region, dirty);

        self.cursor += len;
        let record = RegionRecord {
            handle: handle.id(),
            offset,
            len,
            shape: handle.dims().to_vec(),
        };
        self.by_handle.insert(record.handle, self.regions.len());
        self.regions.push(record.clone());
        log::debug!(
            "offload buffer insert handle={} offset={} len={} remaining={}",
            record.handle,
            offset,
            len,
            self.remaining()
        );
        Ok(record)
    }

    /// Views of every inserted region, in insertion order.
    pub fn get_tensors(&self) -> Result<Vec<Tensor>> {
        self.regions
            .iter()
            .map(|record| {
                Ok(self
                    .storage
                    .narrow(0, record.offset, record.len)?
                    .reshape(record.shape.as_slice())?)
            })
            .collect()
    }

    pub(crate) fn region(&self, offset: usize, len: usize) -> Result<BufferRegion> {
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        if end > self.capacity {
            return Err(OffloadError::shape_mismatch(format!(
                "region [{offset}..{end}) exceeds buffer capacity {}",
                self.capacity
            )));
        }
        Ok(BufferRegion {
            storage: self.storage.clone(),
            offset,
            len,
        })
    }
}

fn try_zeroed<T: WithDType>(capacity: usize, device: &Device) -> Result<Tensor> {
    let bytes = capacity.saturating_mul(std::mem::size_of::<T>());
    let mut data: Vec<T> = Vec::new();
    data.try_reserve_exact(capacity)
        .map_err(|_| OffloadError::OutOfMemory { bytes })?;
    data.resize(capacity, T::from_f64(0.0));
    Ok(Tensor::from_vec(data, capacity, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Location;

    fn handle_with(values: &[f32], shape: &[usize]) -> OffloadTensorHandle {
        let tensor = Tensor::from_slice(values, shape, &Device::Cpu).unwrap();
        OffloadTensorHandle::from_tensor(&tensor).unwrap()
    }

    #[test]
    fn inserts_pack_back_to_back() {
        let mut buffer = OffloadBuffer::allocate(16, DType::F32, &Device::Cpu).unwrap();
        let mut a = handle_with(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let mut b = handle_with(&[5.0, 6.0, 7.0], &[3]);

        let ra = buffer.insert(&mut a).unwrap();
        let rb = buffer.insert(&mut b).unwrap();

        assert_eq!((ra.offset, ra.len), (0, 4));
        assert_eq!((rb.offset, rb.len), (4, 3));
        assert_eq!(buffer.used(), 7);
        assert_eq!(buffer.remaining(), 9);
        assert_eq!(a.location(), Location::InSharedBuffer);
        assert_eq!(buffer.region_of(b.id()), Some(&rb));
    }

    #[test]
    fn region_writes_are_visible_through_get_tensors() {
        let mut buffer = OffloadBuffer::allocate(8, DType::F32, &Device::Cpu).unwrap();
        let mut handle = handle_with(&[0.0; 4], &[2, 2]);
        buffer.insert(&mut handle).unwrap();

        let update = Tensor::from_slice(&[9.0f32, 8.0, 7.0, 6.0], (2, 2), &Device::Cpu).unwrap();
        handle.write_in_place(&update).unwrap();

        let views = buffer.get_tensors().unwrap();
        assert_eq!(
            views[0].flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![9.0, 8.0, 7.0, 6.0]
        );
    }

    #[test]
    fn overflow_is_buffer_full() {
        let mut buffer = OffloadBuffer::allocate(5, DType::F32, &Device::Cpu).unwrap();
        let mut a = handle_with(&[1.0; 4], &[4]);
        let mut b = handle_with(&[1.0; 2], &[2]);
        buffer.insert(&mut a).unwrap();

        let err = buffer.insert(&mut b).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::BufferFull {
                requested: 2,
                remaining: 1
            }
        ));
        assert_eq!(b.location(), Location::InMemoryCache);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn double_insert_and_dtype_mismatch_are_rejected() {
        let mut buffer = OffloadBuffer::allocate(8, DType::F32, &Device::Cpu).unwrap();
        let mut handle = handle_with(&[1.0; 2], &[2]);
        buffer.insert(&mut handle).unwrap();
        assert!(matches!(
            buffer.insert(&mut handle).unwrap_err(),
            OffloadError::InvalidBinding(_)
        ));

        let mut wide = OffloadTensorHandle::zeros(2, DType::F64, &Device::Cpu).unwrap();
        assert!(matches!(
            buffer.insert(&mut wide).unwrap_err(),
            OffloadError::ShapeMismatch(_)
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            OffloadBuffer::allocate(0, DType::F32, &Device::Cpu).unwrap_err(),
            OffloadError::Validation(_)
        ));
    }

    #[test]
    fn pointing_at_an_existing_region_copies_nothing() {
        let mut buffer = OffloadBuffer::allocate(6, DType::F32, &Device::Cpu).unwrap();
        let mut first = handle_with(&[1.0, 2.0, 3.0], &[3]);
        buffer.insert(&mut first).unwrap();

        let mut alias = OffloadTensorHandle::zeros(3, DType::F32, &Device::Cpu).unwrap();
        alias.point_to_buffer_region(&buffer, 0).unwrap();
        assert_eq!(
            alias.read_as_value().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
        assert!(alias.point_to_buffer_region(&buffer, 4).is_err());
    }

    #[test]
    fn get_tensors_returns_disjoint_views_in_insertion_order() {
        let mut buffer = OffloadBuffer::allocate(32, DType::F32, &Device::Cpu).unwrap();
        let shapes: [&[usize]; 4] = [&[2, 3], &[5], &[1, 1], &[2, 2, 2]];
        let mut handles: Vec<OffloadTensorHandle> = shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                let numel: usize = shape.iter().product();
                handle_with(&vec![i as f32; numel], shape)
            })
            .collect();
        for handle in &mut handles {
            buffer.insert(handle).unwrap();
        }

        let views = buffer.get_tensors().unwrap();
        assert_eq!(views.len(), shapes.len());
        let mut expected_offset = 0;
        for (i, (view, shape)) in views.iter().zip(shapes).enumerate() {
            assert_eq!(view.dims(), shape);
            assert_eq!(view.layout().start_offset(), expected_offset);
            let values = view.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|&v| v == i as f32));
            expected_offset += view.elem_count();
        }
        assert_eq!(expected_offset, buffer.used());
    }
}
