//! The seam between optimizers and parameter storage.
//!
//! Optimizers only ever talk to [`TrainableOffloadOperand`]; whether the
//! bytes sit in a private cache, a flat buffer or need to come back from disk
//! is the operand's business.

use candle_core::{Tensor, Var};

use crate::{
    errors::{OffloadError, Result},
    handle::OffloadTensorHandle,
};

pub trait TrainableOffloadOperand {
    /// Short label used in logs and error messages.
    fn label(&self) -> String;

    /// Current value. Fails with `NotResident` for evicted operands.
    fn value(&self) -> Result<Tensor>;

    /// Overwrites the value in place.
    fn write_value(&mut self, value: &Tensor) -> Result<()>;

    fn grad(&self) -> Option<&Tensor>;

    fn set_grad(&mut self, grad: Option<Tensor>) -> Result<()>;

    fn requires_grad(&self) -> bool;

    /// Brings an evicted operand back into memory. Resident operands are a
    /// no-op.
    fn ensure_resident(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reads the value, applies `update` and writes the result back.
    fn update_in_place(&mut self, update: &dyn Fn(&Tensor) -> Result<Tensor>) -> Result<()> {
        let current = self.value()?.detach();
        let next = update(&current)?;
        self.write_value(&next)
    }
}

impl TrainableOffloadOperand for OffloadTensorHandle {
    fn label(&self) -> String {
        format!("handle {}", self.id())
    }

    fn value(&self) -> Result<Tensor> {
        self.read_as_value()
    }

    fn write_value(&mut self, value: &Tensor) -> Result<()> {
        self.write_in_place(value)
    }

    fn grad(&self) -> Option<&Tensor> {
        OffloadTensorHandle::grad(self)
    }

    fn set_grad(&mut self, grad: Option<Tensor>) -> Result<()> {
        OffloadTensorHandle::set_grad(self, grad)
    }

    fn requires_grad(&self) -> bool {
        OffloadTensorHandle::requires_grad(self)
    }

    fn ensure_resident(&mut self) -> Result<()> {
        OffloadTensorHandle::ensure_resident(self)
    }
}

/// An ordinary in-memory trainable tensor.
#[derive(Debug, Clone)]
pub struct PlainParameter {
    var: Var,
    grad: Option<Tensor>,
}

impl PlainParameter {
    pub fn new(var: Var) -> Self {
        Self { var, grad: None }
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self::new(Var::from_tensor(&tensor.detach())?))
    }
}

impl TrainableOffloadOperand for PlainParameter {
    fn label(&self) -> String {
        format!("tensor {:?}", self.var.as_tensor().id())
    }

    fn value(&self) -> Result<Tensor> {
        Ok(self.var.as_tensor().clone())
    }

    fn write_value(&mut self, value: &Tensor) -> Result<()> {
        if value.dims() != self.var.dims() {
            return Err(OffloadError::shape_mismatch(format!(
                "parameter expects shape {:?}, got {:?}",
                self.var.dims(),
                value.dims()
            )));
        }
        self.var.set(value)?;
        Ok(())
    }

    fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    fn set_grad(&mut self, grad: Option<Tensor>) -> Result<()> {
        self.grad = grad;
        Ok(())
    }

    fn requires_grad(&self) -> bool {
        true
    }
}
