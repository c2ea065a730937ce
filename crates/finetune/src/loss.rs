use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{FinetuneError, Result};

/// Mean next-token cross entropy over every position of a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// `logits` is `[..., vocab]`, `targets` holds token ids with the leading dims of `logits`.
    /// Returns a scalar tensor that stays attached to the graph.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(FinetuneError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = dims[dims.len() - 1];
        if vocab_size == 0 {
            return Err(FinetuneError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(FinetuneError::runtime(format!(
                "target shape {:?} does not match logits batch/sequence shape {:?}",
                targets.dims(),
                token_dims
            )));
        }

        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(FinetuneError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let logits_flat = logits
            .to_dtype(DType::F32)?
            .reshape((token_count, vocab_size))?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let targets_flat = targets
            .to_device(logits.device())?
            .reshape((token_count,))?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat.to_dtype(DType::U32)?,
            dtype => {
                return Err(FinetuneError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?;
        Ok(nll.mean_all()?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn uniform_logits_give_log_vocab() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 8), DType::F32, &device)?;
        let targets = Tensor::zeros((2, 3), DType::U32, &device)?;
        let loss = CrossEntropyLoss::new()
            .compute(&logits, &targets)?
            .to_vec0::<f32>()?;
        assert!((loss - 8f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_targets_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 8), DType::F32, &device)?;
        let targets = Tensor::zeros((2, 2), DType::U32, &device)?;
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
        Ok(())
    }
}
