//! Per-rank parameter storage backed by one file and one flat buffer.
//!
//! Every registered parameter gets a handle bound to consecutive, disjoint
//! byte ranges of `{directory}/{file_prefix}_rank{rank}` and a region of the
//! rank's [`OffloadBuffer`]. The training loop brackets each step with
//! [`begin_step`](OffloadParameterStore::begin_step), which stages evicted
//! parameters back into their buffer regions, and
//! [`end_step`](OffloadParameterStore::end_step), which writes dirty
//! parameters out and evicts them if configured to.

use std::{
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};

use crate::{
    buffer::OffloadBuffer,
    config::OffloadConfig,
    errors::{OffloadError, Result},
    handle::{HandleId, OffloadTensorHandle},
    operand::TrainableOffloadOperand,
    registry::FileRegionRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    InStep,
}

#[derive(Debug)]
struct StoredParameter {
    name: String,
    handle: OffloadTensorHandle,
    buffer_offset: usize,
}

#[derive(Debug)]
pub struct OffloadParameterStore {
    config: OffloadConfig,
    rank: usize,
    path: PathBuf,
    buffer: OffloadBuffer,
    params: Vec<StoredParameter>,
    by_name: HashMap<String, usize>,
    registry: Option<FileRegionRegistry>,
    next_file_offset: u64,
    phase: StepPhase,
}

impl OffloadParameterStore {
    /// Validates `config`, creates the backing directory and truncates the
    /// rank file.
    pub fn new(config: OffloadConfig, rank: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.directory)
            .map_err(|err| OffloadError::io(&config.directory, err))?;
        let path = config.rank_file(rank);
        File::create(&path).map_err(|err| OffloadError::io(&path, err))?;

        let buffer = OffloadBuffer::allocate(config.buffer_capacity, config.dtype.to_dtype(), device)?;
        let registry = config.check_overlaps.then(FileRegionRegistry::new);
        log::info!(
            "offload store init: rank={} file={} capacity={} dtype={:?}",
            rank,
            path.display(),
            config.buffer_capacity,
            config.dtype
        );

        Ok(Self {
            config,
            rank,
            path,
            buffer,
            params: Vec::new(),
            by_name: HashMap::new(),
            registry,
            next_file_offset: 0,
            phase: StepPhase::Idle,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn buffer(&self) -> &OffloadBuffer {
        &self.buffer
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|param| param.name.as_str())
    }

    pub fn handle(&self, name: &str) -> Option<&OffloadTensorHandle> {
        self.by_name.get(name).map(|&idx| &self.params[idx].handle)
    }

    pub fn handle_mut(&mut self, name: &str) -> Option<&mut OffloadTensorHandle> {
        let idx = *self.by_name.get(name)?;
        Some(&mut self.params[idx].handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = &OffloadTensorHandle> {
        self.params.iter().map(|param| &param.handle)
    }

    /// Registers a trainable parameter initialised from `tensor`.
    ///
    /// The value is cast to the store dtype, written to the next free range
    /// of the rank file and packed into the buffer. With
    /// `release_after_write` the parameter starts the first step evicted. A
    /// failed registration leaves the store as it was.
    pub fn register(&mut self, name: impl Into<String>, tensor: &Tensor) -> Result<HandleId> {
        let name = name.into();
        self.ensure_phase(StepPhase::Idle, "register")?;
        if self.by_name.contains_key(&name) {
            return Err(OffloadError::InvalidBinding(format!(
                "parameter '{name}' is already registered"
            )));
        }

        let dtype = self.buffer.dtype();
        let value = if tensor.dtype() == dtype {
            tensor.detach()
        } else {
            tensor.to_dtype(dtype)?
        };
        let mut handle = OffloadTensorHandle::from_tensor(&value)?.with_requires_grad(true);
        let file_offset = self.next_file_offset;
        handle.set_file_params(&self.path, file_offset)?;
        let len = handle.byte_len()?;
        if let Some(registry) = self.registry.as_mut() {
            registry.claim_handle(&handle)?;
        }

        // Buffer regions are never reclaimed, so the file write goes first.
        let placed = handle
            .persist_to_file(false)
            .and_then(|()| self.buffer.insert(&mut handle));
        let record = match placed {
            Ok(record) => record,
            Err(err) => {
                if let Some(registry) = self.registry.as_mut() {
                    registry.release(&self.path, file_offset);
                }
                return Err(err);
            }
        };
        if self.config.release_after_write {
            handle.evict()?;
        }
        self.next_file_offset = file_offset + len;

        log::debug!(
            "offload store register name={} handle={} file_offset={} buffer_offset={} len={}",
            name,
            handle.id(),
            file_offset,
            record.offset,
            record.len
        );
        let id = handle.id();
        self.by_name.insert(name.clone(), self.params.len());
        self.params.push(StoredParameter {
            name,
            handle,
            buffer_offset: record.offset,
        });
        Ok(id)
    }

    /// Stages every evicted parameter back into its buffer region.
    pub fn begin_step(&mut self) -> Result<()> {
        self.ensure_phase(StepPhase::Idle, "begin_step")?;
        let mut staged = 0;
        for param in &mut self.params {
            if !param.handle.is_resident() {
                param
                    .handle
                    .stage_into_buffer_region(&self.buffer, param.buffer_offset)?;
                staged += 1;
            }
        }
        self.phase = StepPhase::InStep;
        log::debug!(
            "offload store rank={} begin_step staged={} resident={}",
            self.rank,
            staged,
            self.params.len() - staged
        );
        Ok(())
    }

    /// Writes dirty parameters to file and, with `evict_after_step`, drops
    /// their resident copies.
    pub fn end_step(&mut self) -> Result<()> {
        self.ensure_phase(StepPhase::InStep, "end_step")?;
        let mut written = 0;
        for param in &mut self.params {
            let dirty = param.handle.is_dirty();
            if self.config.evict_after_step {
                param.handle.evict()?;
            } else if dirty {
                param.handle.persist_to_file(false)?;
            }
            if dirty {
                written += 1;
            }
        }
        self.phase = StepPhase::Idle;
        log::debug!(
            "offload store rank={} end_step written={} evicted={}",
            self.rank,
            written,
            self.config.evict_after_step
        );
        Ok(())
    }

    /// Buffer views of every parameter, in registration order.
    ///
    /// Fails with `NotResident` while any parameter is evicted, since its
    /// region would hold stale bytes.
    pub fn get_tensors(&self) -> Result<Vec<Tensor>> {
        if let Some(param) = self.params.iter().find(|param| !param.handle.is_resident()) {
            return Err(OffloadError::NotResident(param.handle.id()));
        }
        self.buffer.get_tensors()
    }

    /// Assigns one gradient per parameter, in registration order.
    pub fn set_grads(&mut self, grads: Vec<Tensor>) -> Result<()> {
        if grads.len() != self.params.len() {
            return Err(OffloadError::Validation(vec![format!(
                "expected {} gradients, got {}",
                self.params.len(),
                grads.len()
            )]));
        }
        for (param, grad) in self.params.iter_mut().zip(grads) {
            param.handle.set_grad(Some(grad))?;
        }
        Ok(())
    }

    pub fn zero_grads(&mut self) {
        for param in &mut self.params {
            param.handle.zero_grad();
        }
    }

    /// Operands for an optimizer step, in registration order.
    pub fn operands_mut(&mut self) -> Vec<&mut dyn TrainableOffloadOperand> {
        self.params
            .iter_mut()
            .map(|param| &mut param.handle as &mut dyn TrainableOffloadOperand)
            .collect()
    }

    fn ensure_phase(&self, expected: StepPhase, op: &str) -> Result<()> {
        if self.phase != expected {
            return Err(OffloadError::Validation(vec![format!(
                "{op} called in phase {:?}, expected {:?}",
                self.phase, expected
            )]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Location;
    use candle_core::DType;

    fn store(dir: &Path, capacity: usize) -> OffloadParameterStore {
        OffloadParameterStore::new(OffloadConfig::new(dir, capacity), 0, &Device::Cpu).unwrap()
    }

    #[test]
    fn parameters_get_consecutive_file_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), 32);
        store
            .register("a", &Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        store
            .register("b", &Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap())
            .unwrap();

        let a = store.handle("a").unwrap().file_binding().unwrap().clone();
        let b = store.handle("b").unwrap().file_binding().unwrap().clone();
        assert_eq!((a.offset, a.len), (0, 24));
        assert_eq!((b.offset, b.len), (24, 16));
        assert_eq!(store.path(), dir.path().join("offload_rank0"));
        assert_eq!(fs::metadata(store.path()).unwrap().len(), 40);
        assert_eq!(store.handle("a").unwrap().location(), Location::OnFile);
    }

    #[test]
    fn duplicate_names_and_full_buffers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), 4);
        let t = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        store.register("w", &t).unwrap();
        assert!(matches!(
            store.register("w", &t).unwrap_err(),
            OffloadError::InvalidBinding(_)
        ));
        assert!(matches!(
            store.register("v", &t).unwrap_err(),
            OffloadError::BufferFull { .. }
        ));
        // The failed registration must not leak its file range.
        store
            .register("u", &Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        assert_eq!(store.handle("u").unwrap().file_binding().unwrap().offset, 12);
    }

    #[test]
    fn step_phases_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), 4);
        assert!(store.end_step().is_err());
        store.begin_step().unwrap();
        assert!(store.begin_step().is_err());
        assert!(store
            .register("late", &Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap())
            .is_err());
        store.end_step().unwrap();
        assert_eq!(store.phase(), StepPhase::Idle);
    }

    #[test]
    fn get_tensors_requires_a_staged_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), 4);
        store
            .register("w", &Tensor::ones(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        assert!(matches!(
            store.get_tensors().unwrap_err(),
            OffloadError::NotResident(_)
        ));
        store.begin_step().unwrap();
        let tensors = store.get_tensors().unwrap();
        assert_eq!(tensors[0].to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn failed_write_does_not_poison_later_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ssd");
        let mut store = store(&root, 8);
        let t = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();

        fs::remove_dir_all(&root).unwrap();
        assert!(matches!(
            store.register("a", &t).unwrap_err(),
            OffloadError::Io { .. }
        ));
        assert!(store.is_empty());
        assert_eq!(store.buffer().used(), 0);

        fs::create_dir_all(&root).unwrap();
        store.register("b", &t).unwrap();
        let binding = store.handle("b").unwrap().file_binding().unwrap().clone();
        assert_eq!((binding.offset, binding.len), (0, 16));
        assert_eq!(store.len(), 1);
        assert_eq!(store.buffer().len(), 1);
        store
            .register("c", &Tensor::ones(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        assert_eq!(store.buffer().used(), 6);
    }
}
