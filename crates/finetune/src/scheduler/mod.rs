//! Step-indexed schedules for the optimizer.
//!
//! Every schedule is a pure function of the global step number, so a resumed
//! run reproduces the same rates without persisting scheduler state.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Decay rate applied to the second-moment accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecayRateSchedule {
    /// `1 - (step + 1)^-exponent`.
    Pow { exponent: f64 },
    /// Matches Adam's bias-corrected second moment for the given `beta2`.
    Adam { beta2: f64 },
}

impl Default for DecayRateSchedule {
    fn default() -> Self {
        DecayRateSchedule::Pow { exponent: 0.8 }
    }
}

impl DecayRateSchedule {
    pub fn at(&self, step: usize) -> f64 {
        let t = step as f64;
        match *self {
            DecayRateSchedule::Pow { exponent } => 1.0 - (t + 1.0).powf(-exponent),
            DecayRateSchedule::Adam { beta2 } => {
                beta2 * (1.0 - beta2.powf(t)) / (1.0 - beta2.powf(t + 1.0))
            }
        }
    }

    pub fn validate(&self, label: &str, errors: &mut Vec<String>) {
        match *self {
            DecayRateSchedule::Pow { exponent } => {
                if !(exponent > 0.0 && exponent.is_finite()) {
                    errors.push(format!("{label}.exponent must be a positive number"));
                }
            }
            DecayRateSchedule::Adam { beta2 } => {
                if !(0.0 < beta2 && beta2 < 1.0) {
                    errors.push(format!("{label}.beta2 must be in (0, 1)"));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearningRateSchedule {
    /// `min((step + 1)^-0.5, 0.01)`, scaled by 0.05 when updates are not
    /// multiplied by the parameter scale.
    RelativeStep,
    Constant {
        value: f64,
    },
    WarmupCosine {
        base_lr: f64,
        #[serde(default)]
        min_lr: f64,
        #[serde(default)]
        warmup_steps: usize,
        total_steps: usize,
    },
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        LearningRateSchedule::RelativeStep
    }
}

impl LearningRateSchedule {
    pub fn at(&self, step: usize, multiply_by_parameter_scale: bool) -> f64 {
        match *self {
            LearningRateSchedule::RelativeStep => {
                let lr = ((step as f64) + 1.0).powf(-0.5).min(1e-2);
                if multiply_by_parameter_scale {
                    lr
                } else {
                    lr * 0.05
                }
            }
            LearningRateSchedule::Constant { value } => value,
            LearningRateSchedule::WarmupCosine {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
            } => warmup_cosine(step, base_lr, min_lr, warmup_steps, total_steps),
        }
    }

    pub fn validate(&self, label: &str, errors: &mut Vec<String>) {
        match *self {
            LearningRateSchedule::RelativeStep => {}
            LearningRateSchedule::Constant { value } => {
                if value <= 0.0 {
                    errors.push(format!("{label}.value must be greater than 0"));
                }
            }
            LearningRateSchedule::WarmupCosine {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
            } => {
                if base_lr <= 0.0 {
                    errors.push(format!("{label}.base_lr must be greater than 0"));
                }
                if min_lr < 0.0 || min_lr > base_lr {
                    errors.push(format!("{label}.min_lr must be in [0, base_lr]"));
                }
                if total_steps == 0 {
                    errors.push(format!("{label}.total_steps must be greater than 0"));
                }
                if warmup_steps > total_steps {
                    errors.push(format!("{label}.warmup_steps cannot exceed total_steps"));
                }
            }
        }
    }
}

fn warmup_cosine(
    step: usize,
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        let progress = (step + 1) as f64 / warmup_steps as f64;
        return base_lr * progress;
    }

    if total_steps <= warmup_steps {
        return base_lr.max(min_lr);
    }

    let effective = step.saturating_sub(warmup_steps) as f64;
    let denom = (total_steps - warmup_steps).max(1) as f64;
    let progress = (effective / denom).clamp(0.0, 1.0);
    let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
    min_lr + (base_lr - min_lr) * cosine
}
