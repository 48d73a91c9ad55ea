use candle_core::{DType, Tensor};

use crate::{
    errors::{OffloadError, Result},
    operand::TrainableOffloadOperand,
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    AdamW(AdamWConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl SgdConfig {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptimizerOptions {
    pub clip_global_norm: Option<f64>,
}

/// Optimizer over [`TrainableOffloadOperand`]s.
///
/// Per-operand state is keyed by position, so every call to [`step`] must pass
/// the operands in the same order. Evicted operands are materialized before
/// their value is read; the update is written back through
/// [`TrainableOffloadOperand::write_value`] and leaves the operand dirty.
///
/// [`step`]: OffloadOptimizer::step
#[derive(Debug)]
pub struct OffloadOptimizer {
    config: OptimizerConfig,
    slots: Vec<Option<SlotState>>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct SlotState {
    shape: Vec<usize>,
    momentum: Option<Tensor>,
    first_moment: Option<Tensor>,
    second_moment: Option<Tensor>,
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

impl OffloadOptimizer {
    pub fn new(config: OptimizerConfig, options: OptimizerOptions) -> Result<Self> {
        let learning_rate = match config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        };
        if !(learning_rate > 0.0) {
            return Err(OffloadError::Validation(vec![format!(
                "learning rate must be greater than 0, got {learning_rate}"
            )]));
        }
        Ok(Self {
            config,
            slots: Vec::new(),
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn sgd(config: SgdConfig) -> Result<Self> {
        Self::new(OptimizerConfig::Sgd(config), OptimizerOptions::default())
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn zero_grad(&self, params: &mut [&mut dyn TrainableOffloadOperand]) -> Result<()> {
        for param in params.iter_mut() {
            if param.requires_grad() {
                param.set_grad(None)?;
            }
        }
        Ok(())
    }

    pub fn step(&mut self, params: &mut [&mut dyn TrainableOffloadOperand]) -> Result<()> {
        if self.slots.is_empty() {
            self.slots.resize_with(params.len(), || None);
        } else if self.slots.len() != params.len() {
            return Err(OffloadError::Validation(vec![format!(
                "optimizer tracks {} operands, step received {}",
                self.slots.len(),
                params.len()
            )]));
        }

        let mut processed = Vec::new();
        for (index, param) in params.iter().enumerate() {
            if !param.requires_grad() {
                continue;
            }
            let grad = match param.grad() {
                Some(grad) => grad.detach().to_dtype(DType::F32)?,
                None => continue,
            };
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient { index, grad, norm });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.clip_global_norm {
            let total_norm = processed
                .iter()
                .map(|g| g.norm * g.norm)
                .sum::<f64>()
                .sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0)?;
                    item.norm *= scale;
                }
            }
        }

        self.step += 1;
        for item in processed {
            let param = &mut *params[item.index];
            param.ensure_resident()?;
            let value = param.value()?.detach();
            let slot = self.slots[item.index].get_or_insert_with(|| SlotState {
                shape: value.dims().to_vec(),
                momentum: None,
                first_moment: None,
                second_moment: None,
            });
            if slot.shape.as_slice() != value.dims() {
                return Err(OffloadError::shape_mismatch(format!(
                    "{} changed shape from {:?} to {:?} between steps",
                    param.label(),
                    slot.shape,
                    value.dims()
                )));
            }

            let base = value.to_dtype(DType::F32)?;
            let next = match self.config {
                OptimizerConfig::Sgd(cfg) => sgd_update(cfg, slot, &base, item.grad)?,
                OptimizerConfig::AdamW(cfg) => adamw_update(cfg, self.step, slot, &base, item.grad)?,
            };
            let next = if value.dtype() == DType::F32 {
                next
            } else {
                next.to_dtype(value.dtype())?
            };
            param.write_value(&next)?;
        }

        Ok(())
    }
}

fn sgd_update(cfg: SgdConfig, slot: &mut SlotState, base: &Tensor, grad: Tensor) -> Result<Tensor> {
    let mut grad = grad;
    if cfg.weight_decay != 0.0 {
        grad = grad.add(&base.affine(cfg.weight_decay, 0.0)?)?;
    }
    if cfg.momentum != 0.0 {
        let buf = match slot.momentum.take() {
            Some(prev) => prev.affine(cfg.momentum, 0.0)?.add(&grad)?,
            None => grad,
        };
        slot.momentum = Some(buf.clone());
        grad = buf;
    }
    Ok(base.sub(&(grad * cfg.learning_rate)?)?)
}

fn adamw_update(
    cfg: AdamWConfig,
    step: usize,
    slot: &mut SlotState,
    base: &Tensor,
    grad: Tensor,
) -> Result<Tensor> {
    let bias_correction1 = 1.0 - cfg.beta1.powi(step as i32);
    let bias_correction2 = 1.0 - cfg.beta2.powi(step as i32);
    let scale_m = if bias_correction1.abs() < EPS {
        1.0
    } else {
        1.0 / bias_correction1
    };
    let scale_v = if bias_correction2.abs() < EPS {
        1.0
    } else {
        1.0 / bias_correction2
    };

    let prev_m = match slot.first_moment.take() {
        Some(m) => m,
        None => base.zeros_like()?,
    };
    let prev_v = match slot.second_moment.take() {
        Some(v) => v,
        None => base.zeros_like()?,
    };

    let new_m = prev_m
        .affine(cfg.beta1, 0.0)?
        .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
    let new_v = prev_v
        .affine(cfg.beta2, 0.0)?
        .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

    let m_hat = new_m.affine(scale_m, 0.0)?;
    let v_hat = new_v.affine(scale_v, 0.0)?;
    let denom = v_hat.sqrt()?.affine(1.0, cfg.epsilon)?;
    let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

    let decayed = if cfg.weight_decay != 0.0 {
        base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
    } else {
        base.clone()
    };

    slot.first_moment = Some(new_m);
    slot.second_moment = Some(new_v);
    Ok(decayed.sub(&update)?)
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64> {
    let value = tensor.sqr()?.sum_all()?.to_vec0::<f32>()?;
    Ok((value as f64).sqrt())
}
