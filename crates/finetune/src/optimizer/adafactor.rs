//! Adafactor: adaptive updates with factored second-moment estimates.
//!
//! For a parameter of rank >= 2 only the row and column means of the squared
//! gradient are tracked (over the last two axes), so an `A x B` matrix keeps
//! `A + B` accumulator entries instead of `A * B`. Lower-rank parameters keep
//! a full accumulator. Updates are clipped by their RMS and, by default,
//! scaled relative to the RMS of the parameter itself.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use super::{GradientSource, ParameterStore};
use crate::{
    config,
    scheduler::{DecayRateSchedule, LearningRateSchedule},
    FinetuneError, Result,
};

#[derive(Debug, Clone, PartialEq)]
pub struct AdafactorConfig {
    pub learning_rate: LearningRateSchedule,
    pub decay_rate: DecayRateSchedule,
    /// Momentum coefficient; 0 disables the momentum slot.
    pub beta1: f64,
    pub clipping_threshold: Option<f64>,
    pub factored: bool,
    pub multiply_by_parameter_scale: bool,
    /// Added to squared gradients.
    pub epsilon1: f64,
    /// Floor for the parameter scale.
    pub epsilon2: f64,
}

impl Default for AdafactorConfig {
    fn default() -> Self {
        Self {
            learning_rate: LearningRateSchedule::RelativeStep,
            decay_rate: DecayRateSchedule::default(),
            beta1: 0.0,
            clipping_threshold: Some(1.0),
            factored: true,
            multiply_by_parameter_scale: true,
            epsilon1: 1e-30,
            epsilon2: 1e-3,
        }
    }
}

impl From<&config::OptimizerConfig> for AdafactorConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            decay_rate: value.decay_rate,
            beta1: value.beta1,
            clipping_threshold: value.clipping_threshold,
            factored: value.factored,
            multiply_by_parameter_scale: value.multiply_by_parameter_scale,
            epsilon1: value.epsilon1,
            epsilon2: value.epsilon2,
        }
    }
}

#[derive(Debug, Clone)]
enum SecondMoment {
    /// `row` has the parameter shape without its last axis, `col` without its
    /// second-to-last axis.
    Factored { row: Tensor, col: Tensor },
    Full { accumulator: Tensor },
}

/// Optimizer state for one parameter, fixed at registration.
#[derive(Debug, Clone)]
pub struct ParameterSlot {
    name: String,
    shape: Vec<usize>,
    second_moment: SecondMoment,
    momentum: Option<Tensor>,
}

impl ParameterSlot {
    fn new(name: &str, shape: &[usize], device: &Device, config: &AdafactorConfig) -> Result<Self> {
        let rank = shape.len();
        let second_moment = if config.factored && rank >= 2 {
            let row_shape = shape[..rank - 1].to_vec();
            let mut col_shape = shape[..rank - 2].to_vec();
            col_shape.push(shape[rank - 1]);
            SecondMoment::Factored {
                row: Tensor::zeros(row_shape, DType::F32, device)?,
                col: Tensor::zeros(col_shape, DType::F32, device)?,
            }
        } else {
            SecondMoment::Full {
                accumulator: Tensor::zeros(shape, DType::F32, device)?,
            }
        };
        let momentum = if config.beta1 > 0.0 {
            Some(Tensor::zeros(shape, DType::F32, device)?)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            second_moment,
            momentum,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_factored(&self) -> bool {
        matches!(self.second_moment, SecondMoment::Factored { .. })
    }

    pub fn has_momentum(&self) -> bool {
        self.momentum.is_some()
    }

    /// Number of second-moment scalars kept for this parameter.
    pub fn auxiliary_len(&self) -> usize {
        match &self.second_moment {
            SecondMoment::Factored { row, col } => row.elem_count() + col.elem_count(),
            SecondMoment::Full { accumulator } => accumulator.elem_count(),
        }
    }

    /// Computes the amount to subtract from `param` and advances the slot.
    fn update(
        &mut self,
        grad: &Tensor,
        param: &Tensor,
        decay_rate: f64,
        learning_rate: f64,
        config: &AdafactorConfig,
    ) -> Result<Tensor> {
        let mixing_rate = 1.0 - decay_rate;
        let grad_squared = grad.sqr()?.affine(1.0, config.epsilon1)?;

        let x = match &mut self.second_moment {
            SecondMoment::Factored { row, col } => {
                let rank = grad.rank();
                let row_mean = grad_squared.mean(rank - 1)?;
                let col_mean = grad_squared.mean(rank - 2)?;
                let new_row = row
                    .affine(decay_rate, 0.0)?
                    .add(&row_mean.affine(mixing_rate, 0.0)?)?;
                let new_col = col
                    .affine(decay_rate, 0.0)?
                    .add(&col_mean.affine(mixing_rate, 0.0)?)?;

                let long_term_mean = new_row.mean_keepdim(rank - 2)?;
                let row_factor = new_row.broadcast_div(&long_term_mean)?.sqrt()?.recip()?;
                let col_factor = new_col.sqrt()?.recip()?;
                let x = grad
                    .broadcast_mul(&row_factor.unsqueeze(rank - 1)?)?
                    .broadcast_mul(&col_factor.unsqueeze(rank - 2)?)?;

                *row = new_row;
                *col = new_col;
                x
            }
            SecondMoment::Full { accumulator } => {
                let new_accumulator = accumulator
                    .affine(decay_rate, 0.0)?
                    .add(&grad_squared.affine(mixing_rate, 0.0)?)?;
                let x = grad.mul(&new_accumulator.sqrt()?.recip()?)?;
                *accumulator = new_accumulator;
                x
            }
        };

        let x = match config.clipping_threshold {
            Some(threshold) => {
                let clipping_denom = (rms(&x)? / threshold).max(1.0);
                x.affine(1.0 / clipping_denom, 0.0)?
            }
            None => x,
        };

        let mut update_scale = learning_rate;
        if config.multiply_by_parameter_scale {
            update_scale *= rms(param)?.max(config.epsilon2);
        }
        let subtrahend = x.affine(update_scale, 0.0)?;

        match self.momentum.as_mut() {
            Some(momentum) => {
                let new_momentum = momentum
                    .affine(config.beta1, 0.0)?
                    .add(&subtrahend.affine(1.0 - config.beta1, 0.0)?)?;
                *momentum = new_momentum.clone();
                Ok(new_momentum)
            }
            None => Ok(subtrahend),
        }
    }

    fn state_tensors(&self, out: &mut HashMap<String, Tensor>) {
        match &self.second_moment {
            SecondMoment::Factored { row, col } => {
                out.insert(format!("{}/row", self.name), row.clone());
                out.insert(format!("{}/col", self.name), col.clone());
            }
            SecondMoment::Full { accumulator } => {
                out.insert(format!("{}/acc", self.name), accumulator.clone());
            }
        }
        if let Some(momentum) = &self.momentum {
            out.insert(format!("{}/momentum", self.name), momentum.clone());
        }
    }

    fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<usize> {
        let name = self.name.clone();
        let mut loaded = 0;
        let mut restore = |suffix: &str, slot: &mut Tensor| -> Result<()> {
            let key = format!("{name}/{suffix}");
            let Some(saved) = tensors.get(&key) else {
                log::warn!("optimizer state has no entry '{key}', starting it from zero");
                return Ok(());
            };
            if saved.dims() != slot.dims() {
                return Err(FinetuneError::runtime(format!(
                    "optimizer state '{key}' has shape {:?}, expected {:?}",
                    saved.dims(),
                    slot.dims()
                )));
            }
            *slot = saved.to_device(slot.device())?.to_dtype(DType::F32)?;
            loaded += 1;
            Ok(())
        };

        match &mut self.second_moment {
            SecondMoment::Factored { row, col } => {
                restore("row", row)?;
                restore("col", col)?;
            }
            SecondMoment::Full { accumulator } => restore("acc", accumulator)?,
        }
        if let Some(momentum) = self.momentum.as_mut() {
            restore("momentum", momentum)?;
        }
        Ok(loaded)
    }
}

/// Outcome of one [`Adafactor::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub learning_rate: f64,
    pub decay_rate: f64,
    /// Parameters that had a gradient and were updated.
    pub updated: usize,
}

#[derive(Debug)]
pub struct Adafactor {
    config: AdafactorConfig,
    slots: Vec<ParameterSlot>,
}

impl Adafactor {
    /// Registers one slot per parameter in `params`.
    pub fn new<S>(config: AdafactorConfig, params: &S) -> Result<Self>
    where
        S: ParameterStore + ?Sized,
    {
        if params.is_empty() {
            return Err(FinetuneError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut slots = Vec::with_capacity(params.len());
        for index in 0..params.len() {
            let name = params.name(index);
            let tensor = params.get(index)?;
            if !tensor.dtype().is_float() {
                return Err(FinetuneError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            slots.push(ParameterSlot::new(
                name,
                tensor.dims(),
                tensor.device(),
                &config,
            )?);
        }

        Ok(Self { config, slots })
    }

    pub fn config(&self) -> &AdafactorConfig {
        &self.config
    }

    pub fn slots(&self) -> &[ParameterSlot] {
        &self.slots
    }

    /// Total second-moment scalars across all slots.
    pub fn auxiliary_len(&self) -> usize {
        self.slots.iter().map(ParameterSlot::auxiliary_len).sum()
    }

    /// Applies one update at global step `step` to every parameter that has a gradient.
    pub fn step<S, G>(&mut self, params: &S, grads: &G, step: usize) -> Result<StepReport>
    where
        S: ParameterStore + ?Sized,
        G: GradientSource + ?Sized,
    {
        if params.len() != self.slots.len() {
            return Err(FinetuneError::runtime(format!(
                "optimizer was registered with {} parameters but received {}",
                self.slots.len(),
                params.len()
            )));
        }

        let decay_rate = self.config.decay_rate.at(step);
        let learning_rate = self
            .config
            .learning_rate
            .at(step, self.config.multiply_by_parameter_scale);

        let mut updated = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let param = params.get(index)?;
            if param.dims() != slot.shape.as_slice() {
                return Err(FinetuneError::runtime(format!(
                    "parameter '{}' changed shape from {:?} to {:?}",
                    slot.name,
                    slot.shape,
                    param.dims()
                )));
            }
            let Some(gradient) = grads.gradient(index, &param) else {
                continue;
            };

            let grad = gradient.densify(&slot.shape)?;
            let old_value = param.to_dtype(DType::F32)?;
            let delta = slot.update(&grad, &old_value, decay_rate, learning_rate, &self.config)?;
            let new_value = old_value.sub(&delta)?;
            let new_value = if param.dtype() == DType::F32 {
                new_value
            } else {
                new_value.to_dtype(param.dtype())?
            };
            params.set(index, &new_value)?;
            updated += 1;
        }

        Ok(StepReport {
            step,
            learning_rate,
            decay_rate,
            updated,
        })
    }

    /// Slot tensors keyed by `<parameter>/{row,col,acc,momentum}`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::new();
        for slot in &self.slots {
            slot.state_tensors(&mut out);
        }
        out
    }

    /// Restores slot tensors saved by [`Adafactor::state_tensors`].
    ///
    /// Entries missing from `tensors` stay at zero. Returns the number of
    /// tensors restored.
    pub fn load_state_tensors(&mut self, tensors: &HashMap<String, Tensor>) -> Result<usize> {
        let mut loaded = 0;
        for slot in &mut self.slots {
            loaded += slot.load_state_tensors(tensors)?;
        }
        Ok(loaded)
    }
}

/// `sqrt(mean(x^2))` as a host scalar.
pub fn rms(tensor: &Tensor) -> Result<f64> {
    let value = tensor
        .sqr()?
        .mean_all()?
        .sqrt()?
        .to_dtype(DType::F32)?
        .to_vec0::<f32>()?;
    Ok(value as f64)
}

#[cfg(test)]
mod tests {
    use candle_core::Var;

    use super::*;
    use crate::optimizer::{Gradient, ParameterSet};

    fn store(shapes: &[&[usize]]) -> Result<ParameterSet> {
        let device = Device::Cpu;
        let params = shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| Ok((format!("p{i}"), Var::ones(*shape, DType::F32, &device)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterSet::new(params))
    }

    #[test]
    fn unfactored_config_uses_full_slots() -> Result<()> {
        let params = store(&[&[4, 3]])?;
        let config = AdafactorConfig {
            factored: false,
            ..AdafactorConfig::default()
        };
        let optimizer = Adafactor::new(config, &params)?;
        assert!(!optimizer.slots()[0].is_factored());
        assert_eq!(optimizer.auxiliary_len(), 12);
        Ok(())
    }

    #[test]
    fn state_round_trips_through_tensor_map() -> Result<()> {
        let params = store(&[&[2, 3], &[3]])?;
        let config = AdafactorConfig {
            beta1: 0.9,
            ..AdafactorConfig::default()
        };
        let mut optimizer = Adafactor::new(config.clone(), &params)?;
        let grads = vec![
            Some(Gradient::Dense(Tensor::ones((2, 3), DType::F32, &Device::Cpu)?)),
            Some(Gradient::Dense(Tensor::ones(3, DType::F32, &Device::Cpu)?)),
        ];
        optimizer.step(&params, &grads, 0)?;
        let saved = optimizer.state_tensors();
        assert_eq!(saved.len(), 5);

        let mut restored = Adafactor::new(config, &params)?;
        assert_eq!(restored.load_state_tensors(&saved)?, 5);
        let original = optimizer.state_tensors();
        for (key, tensor) in restored.state_tensors() {
            let expected = original[&key].flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(tensor.flatten_all()?.to_vec1::<f32>()?, expected, "{key}");
        }
        Ok(())
    }

    #[test]
    fn parameters_without_gradients_are_skipped() -> Result<()> {
        let params = store(&[&[2, 2], &[2]])?;
        let mut optimizer = Adafactor::new(AdafactorConfig::default(), &params)?;
        let grads: Vec<Option<Gradient>> = vec![
            None,
            Some(Gradient::Dense(Tensor::ones(2, DType::F32, &Device::Cpu)?)),
        ];
        let report = optimizer.step(&params, &grads, 0)?;
        assert_eq!(report.updated, 1);
        assert_eq!(params.get(0)?.to_vec2::<f32>()?, vec![vec![1.0; 2]; 2]);
        Ok(())
    }
}
