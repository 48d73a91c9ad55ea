use candle_core::{DType, Result as CandleResult, Tensor};

use crate::checks::{check_inputs, check_weight, Projection};
use crate::core::{errors::to_backend_err, KernelConfig, KernelKind, SoftmaxError, SoftmaxKernel};

/// Dense softmax spelled out as shift, exponentiate and normalize on the
/// projected logits instead of the fused op.
///
/// Only `f32` weights are accepted.
#[derive(Debug, Clone)]
pub struct InplaceSoftmax {
    weight: Tensor,
    projection: Projection,
}

impl SoftmaxKernel for InplaceSoftmax {
    type Output = Tensor;

    const KIND: KernelKind = KernelKind::Inplace;

    fn build(weight: &Tensor, config: &KernelConfig) -> Result<Self, SoftmaxError> {
        config.validate()?;
        let projection = check_weight(weight)?;
        if projection.dtype != DType::F32 {
            return Err(SoftmaxError::UnsupportedDType {
                requested: format!("{:?}, the inplace kernel only supports F32", projection.dtype),
            });
        }
        log::info!(
            "sparse_softmax::inplace init hidden={} vocab={}",
            projection.hidden,
            projection.vocab
        );
        Ok(Self {
            weight: weight.clone(),
            projection,
        })
    }

    fn forward(&self, activation: &Tensor, labels: &Tensor) -> Result<Tensor, SoftmaxError> {
        check_inputs(&self.projection, self.weight.device(), activation, labels)?;
        exp_normalize(activation, &self.weight).map_err(to_backend_err)
    }
}

fn exp_normalize(activation: &Tensor, weight: &Tensor) -> CandleResult<Tensor> {
    let logits = activation.matmul(weight)?;
    let max = logits.max_keepdim(1)?;
    let exp = logits.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(1)?;
    exp.broadcast_div(&sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::BaselineSoftmax;
    use candle_core::Device;

    #[test]
    fn agrees_with_baseline() {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1.0, (8, 32), &device).unwrap();
        let activation = Tensor::randn(0f32, 1.0, (5, 8), &device).unwrap();
        let labels = Tensor::new(&[0u32, 1, 2, 3, 4], &device).unwrap();
        let config = KernelConfig::default();

        let inplace = InplaceSoftmax::build(&weight, &config)
            .unwrap()
            .forward(&activation, &labels)
            .unwrap();
        let baseline = BaselineSoftmax::build(&weight, &config)
            .unwrap()
            .forward(&activation, &labels)
            .unwrap();
        let diff = inplace
            .sub(&baseline)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn rejects_reduced_precision() {
        let weight = Tensor::zeros((2, 2), DType::BF16, &Device::Cpu).unwrap();
        assert!(matches!(
            InplaceSoftmax::build(&weight, &KernelConfig::default()),
            Err(SoftmaxError::UnsupportedDType { .. })
        ));
    }
}
