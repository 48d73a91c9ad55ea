//! SSD-backed tensor handles.
//!
//! An [`OffloadTensorHandle`] stands in for a trainable tensor whose bytes may
//! live in one of three places:
//!
//! * a private resident cache ([`Location::InMemoryCache`]),
//! * a region of a shared [`OffloadBuffer`] ([`Location::InSharedBuffer`]),
//! * a byte range of a backing file ([`Location::OnFile`]).
//!
//! Exactly one of those is authoritative at any time and only the transition
//! methods on the handle change which one. A handle in `OnFile` holds no
//! tensor at all, so reads and writes fail with
//! [`OffloadError::NotResident`] until the caller materializes it again.
//!
//! The handle never checks whether two handles are bound to overlapping byte
//! ranges of the same file. Callers that need that guarantee go through
//! [`FileRegionRegistry`](crate::registry::FileRegionRegistry).

use std::{
    fmt,
    ops::{Add, Mul},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use candle_core::{backprop::GradStore, DType, Device, Shape, Tensor, Var};

use crate::{
    buffer::{BufferRegion, OffloadBuffer},
    codec,
    errors::{OffloadError, Result},
};

/// Process-unique identity of a handle, used as the key in buffer maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which storage currently holds the authoritative bytes of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    InMemoryCache,
    OnFile,
    InSharedBuffer,
}

/// Byte region of a backing file that persist/materialize calls target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBinding {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug)]
enum Residency {
    Cache(Var),
    File,
    Buffer(BufferRegion),
}

impl Residency {
    fn location(&self) -> Location {
        match self {
            Residency::Cache(_) => Location::InMemoryCache,
            Residency::File => Location::OnFile,
            Residency::Buffer(_) => Location::InSharedBuffer,
        }
    }
}

#[derive(Debug)]
pub struct OffloadTensorHandle {
    id: HandleId,
    shape: Shape,
    dtype: DType,
    device: Device,
    residency: Residency,
    file: Option<FileBinding>,
    requires_grad: bool,
    grad: Option<Tensor>,
    dirty: bool,
}

impl OffloadTensorHandle {
    /// Creates a zero-initialised, resident handle.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &Device) -> Result<Self> {
        let shape = shape.into();
        codec::ensure_supported(dtype)?;
        let cache = Var::zeros(shape.clone(), dtype, device)?;
        Ok(Self::with_residency(
            shape,
            dtype,
            device.clone(),
            Residency::Cache(cache),
        ))
    }

    /// Creates a resident handle holding a private copy of `tensor`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        codec::ensure_supported(tensor.dtype())?;
        let cache = Var::from_tensor(&tensor.detach())?;
        Ok(Self::with_residency(
            tensor.shape().clone(),
            tensor.dtype(),
            tensor.device().clone(),
            Residency::Cache(cache),
        ))
    }

    fn with_residency(shape: Shape, dtype: DType, device: Device, residency: Residency) -> Self {
        Self {
            id: HandleId::next(),
            shape,
            dtype,
            device,
            residency,
            file: None,
            requires_grad: false,
            grad: None,
            dirty: true,
        }
    }

    /// Marks the handle as a trainable parameter with a gradient slot.
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        if !requires_grad {
            self.grad = None;
        }
        self
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn numel(&self) -> usize {
        self.shape.elem_count()
    }

    /// Size of the on-file image in bytes.
    pub fn byte_len(&self) -> Result<u64> {
        codec::byte_len(self.dims(), self.dtype)
    }

    pub fn location(&self) -> Location {
        self.residency.location()
    }

    pub fn is_resident(&self) -> bool {
        self.location() != Location::OnFile
    }

    /// Whether the resident bytes may differ from the bound file region.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn file_binding(&self) -> Option<&FileBinding> {
        self.file.as_ref()
    }

    /// Binds future persist/materialize calls to `path` at byte `offset`.
    pub fn set_file_params(&mut self, path: impl AsRef<Path>, offset: u64) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(OffloadError::InvalidBinding(format!(
                "handle {} bound to an empty path",
                self.id
            )));
        }
        let len = self.byte_len()?;
        if offset.checked_add(len).is_none() {
            return Err(OffloadError::InvalidBinding(format!(
                "offset {offset} + {len} bytes overflows the file size for handle {}",
                self.id
            )));
        }
        self.file = Some(FileBinding {
            path: path.to_path_buf(),
            offset,
            len,
        });
        Ok(())
    }

    fn binding(&self) -> Result<FileBinding> {
        self.file.clone().ok_or(OffloadError::NoFileBound(self.id))
    }

    /// Writes the authoritative bytes to the bound file region.
    ///
    /// With `release_cache` the handle moves to [`Location::OnFile`] and drops
    /// its resident copy; otherwise it stays where it is with a clean dirty
    /// flag. A partial write leaves the file region in an undefined state.
    pub fn persist_to_file(&mut self, release_cache: bool) -> Result<()> {
        let binding = self.binding()?;
        let value = match &self.residency {
            Residency::Cache(var) => var.as_detached_tensor(),
            Residency::Buffer(region) => region.view(&self.shape)?,
            Residency::File => {
                log::debug!("handle {} already on file, nothing to persist", self.id);
                return Ok(());
            }
        };
        let bytes = codec::encode(&value)?;
        codec::write_region(&binding.path, binding.offset, &bytes)?;
        self.dirty = false;
        if release_cache {
            self.residency = Residency::File;
            log::debug!("handle {} evicted to {}", self.id, binding.path.display());
        }
        Ok(())
    }

    /// Moves the handle to [`Location::OnFile`]. Only a dirty handle is
    /// written; a clean one already matches its file region and just drops
    /// the resident copy.
    pub fn evict(&mut self) -> Result<()> {
        if !self.is_resident() {
            return Ok(());
        }
        if self.dirty {
            return self.persist_to_file(true);
        }
        let binding = self.binding()?;
        self.residency = Residency::File;
        log::debug!(
            "handle {} evicted clean, {} untouched",
            self.id,
            binding.path.display()
        );
        Ok(())
    }

    /// Reads the bound file region into a freshly allocated resident cache.
    pub fn materialize_from_file(&mut self) -> Result<()> {
        let binding = self.binding()?;
        let value = self.read_file(&binding)?;
        self.warn_if_discarding();
        self.residency = Residency::Cache(Var::from_tensor(&value)?);
        self.dirty = false;
        log::debug!(
            "handle {} materialized from {}@{}",
            self.id,
            binding.path.display(),
            binding.offset
        );
        Ok(())
    }

    /// Binds the handle to `path`/`offset` and materializes from it.
    pub fn point_to_file(&mut self, path: impl AsRef<Path>, offset: u64) -> Result<()> {
        self.set_file_params(path, offset)?;
        self.materialize_from_file()
    }

    /// Makes a region of `buffer` starting at element `offset` authoritative.
    ///
    /// No bytes are copied: whatever the region holds becomes the value.
    pub fn point_to_buffer_region(&mut self, buffer: &OffloadBuffer, offset: usize) -> Result<()> {
        let region = self.region_in(buffer, offset)?;
        self.warn_if_discarding();
        self.residency = Residency::Buffer(region);
        self.dirty = true;
        Ok(())
    }

    /// Reads the bound file region straight into a buffer region and makes
    /// that region authoritative.
    pub fn stage_into_buffer_region(&mut self, buffer: &OffloadBuffer, offset: usize) -> Result<()> {
        let binding = self.binding()?;
        let region = self.region_in(buffer, offset)?;
        let value = self.read_file(&binding)?;
        region.write(&value)?;
        self.warn_if_discarding();
        self.residency = Residency::Buffer(region);
        self.dirty = false;
        Ok(())
    }

    /// Adopts `tensor` as the resident value, replacing the current source.
    pub fn point_to_tensor(&mut self, tensor: &Tensor) -> Result<()> {
        self.check_compatible(tensor, "point_to_tensor")?;
        self.residency = Residency::Cache(Var::from_tensor(&tensor.detach())?);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn adopt_region(&mut self, region: BufferRegion, dirty: bool) {
        self.residency = Residency::Buffer(region);
        self.dirty = dirty;
    }

    /// Current value. Trainable handles in the resident cache return the
    /// tracked variable so that backward passes produce gradients for it.
    pub fn read_as_value(&self) -> Result<Tensor> {
        match &self.residency {
            Residency::Cache(var) if self.requires_grad => Ok(var.as_tensor().clone()),
            Residency::Cache(var) => Ok(var.as_detached_tensor()),
            Residency::Buffer(region) => region.view(&self.shape),
            Residency::File => Err(OffloadError::NotResident(self.id)),
        }
    }

    /// Overwrites the authoritative bytes in place.
    ///
    /// `value` must not alias the destination storage; pass a fresh tensor.
    pub fn write_in_place(&mut self, value: &Tensor) -> Result<()> {
        self.check_compatible(value, "write_in_place")?;
        match &self.residency {
            Residency::Cache(var) => var.set(value)?,
            Residency::Buffer(region) => region.write(value)?,
            Residency::File => return Err(OffloadError::NotResident(self.id)),
        }
        self.dirty = true;
        Ok(())
    }

    /// Materializes from file when the handle has been evicted.
    pub fn ensure_resident(&mut self) -> Result<()> {
        if self.is_resident() {
            Ok(())
        } else {
            self.materialize_from_file()
        }
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn set_grad(&mut self, grad: Option<Tensor>) -> Result<()> {
        if !self.requires_grad {
            return Err(OffloadError::NotTrainable(self.id));
        }
        if let Some(grad) = &grad {
            if grad.dims() != self.dims() {
                return Err(OffloadError::shape_mismatch(format!(
                    "gradient for handle {} has shape {:?}, expected {:?}",
                    self.id,
                    grad.dims(),
                    self.dims()
                )));
            }
        }
        self.grad = grad;
        Ok(())
    }

    /// Pulls this handle's gradient out of a backward pass.
    ///
    /// Only resident trainable handles are tracked by autograd; buffer views
    /// receive their gradients through [`set_grad`](Self::set_grad). Returns
    /// whether a gradient was found.
    pub fn capture_grad(&mut self, grads: &GradStore) -> Result<bool> {
        if !self.requires_grad {
            return Err(OffloadError::NotTrainable(self.id));
        }
        let grad = match &self.residency {
            Residency::Cache(var) => grads.get(var.as_tensor()).cloned(),
            _ => None,
        };
        match grad {
            Some(grad) => {
                self.grad = Some(grad);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    fn check_compatible(&self, tensor: &Tensor, op: &str) -> Result<()> {
        if tensor.dims() != self.dims() {
            return Err(OffloadError::shape_mismatch(format!(
                "{op} on handle {} expects shape {:?}, got {:?}",
                self.id,
                self.dims(),
                tensor.dims()
            )));
        }
        if tensor.dtype() != self.dtype {
            return Err(OffloadError::shape_mismatch(format!(
                "{op} on handle {} expects dtype {:?}, got {:?}",
                self.id,
                self.dtype,
                tensor.dtype()
            )));
        }
        Ok(())
    }

    fn region_in(&self, buffer: &OffloadBuffer, offset: usize) -> Result<BufferRegion> {
        if buffer.dtype() != self.dtype {
            return Err(OffloadError::shape_mismatch(format!(
                "buffer dtype {:?} does not match handle {} dtype {:?}",
                buffer.dtype(),
                self.id,
                self.dtype
            )));
        }
        buffer.region(offset, self.numel())
    }

    fn read_file(&self, binding: &FileBinding) -> Result<Tensor> {
        let bytes = codec::read_region(&binding.path, binding.offset, binding.len)?;
        codec::decode(&bytes, self.dtype, self.dims(), &self.device)
    }

    fn warn_if_discarding(&self) {
        if self.dirty && self.is_resident() && self.file.is_some() {
            log::warn!(
                "handle {} discards unsaved {:?} contents",
                self.id,
                self.location()
            );
        }
    }
}

impl Add<f64> for &OffloadTensorHandle {
    type Output = Result<Tensor>;

    fn add(self, rhs: f64) -> Self::Output {
        Ok(self.read_as_value()?.affine(1.0, rhs)?)
    }
}

impl Add<&Tensor> for &OffloadTensorHandle {
    type Output = Result<Tensor>;

    fn add(self, rhs: &Tensor) -> Self::Output {
        Ok(self.read_as_value()?.broadcast_add(rhs)?)
    }
}

impl Mul<f64> for &OffloadTensorHandle {
    type Output = Result<Tensor>;

    fn mul(self, rhs: f64) -> Self::Output {
        Ok(self.read_as_value()?.affine(rhs, 0.0)?)
    }
}
