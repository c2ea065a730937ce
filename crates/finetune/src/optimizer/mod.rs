//! Parameter and gradient plumbing shared by the optimizer.
//!
//! The optimizer only sees named tensors through [`ParameterStore`] and
//! per-parameter gradients through [`GradientSource`]; it never touches the
//! computation graph that produced them.

pub mod adafactor;

pub use adafactor::{Adafactor, AdafactorConfig, ParameterSlot, StepReport};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{FinetuneError, Result};

/// Indexed access to the trainable parameters.
pub trait ParameterStore {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self, index: usize) -> &str;

    fn get(&self, index: usize) -> Result<Tensor>;

    fn set(&self, index: usize, value: &Tensor) -> Result<()>;
}

/// Named candle variables, in model order.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<(String, Var)>,
}

impl ParameterSet {
    pub fn new(params: Vec<(String, Var)>) -> Self {
        Self { params }
    }

    /// Keeps only the last `count` parameters; all of them when `count` is `None`.
    pub fn trailing(params: Vec<(String, Var)>, count: Option<usize>) -> Self {
        let skip = match count {
            Some(count) => params.len().saturating_sub(count),
            None => 0,
        };
        Self {
            params: params.into_iter().skip(skip).collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.params.iter().map(|(_, var)| var)
    }

    pub fn element_count(&self) -> usize {
        self.params
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    fn entry(&self, index: usize) -> Result<&(String, Var)> {
        self.params.get(index).ok_or_else(|| {
            FinetuneError::runtime(format!(
                "parameter index {index} out of range ({} parameters)",
                self.params.len()
            ))
        })
    }
}

impl ParameterStore for ParameterSet {
    fn len(&self) -> usize {
        self.params.len()
    }

    fn name(&self, index: usize) -> &str {
        self.params
            .get(index)
            .map(|(name, _)| name.as_str())
            .unwrap_or("<unknown>")
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        Ok(self.entry(index)?.1.as_tensor().clone())
    }

    fn set(&self, index: usize, value: &Tensor) -> Result<()> {
        let (name, var) = self.entry(index)?;
        var.set(value).map_err(|err| {
            FinetuneError::runtime(format!("failed to update parameter '{name}': {err}"))
        })
    }
}

/// Gradient for one parameter.
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(Tensor),
    /// Rows `indices` (along the first axis) of the full gradient.
    /// Repeated indices accumulate.
    Sparse { indices: Tensor, values: Tensor },
}

impl Gradient {
    /// Dense `f32` gradient with the parameter's shape.
    pub fn densify(&self, shape: &[usize]) -> Result<Tensor> {
        match self {
            Gradient::Dense(grad) => {
                if grad.dims() != shape {
                    return Err(FinetuneError::runtime(format!(
                        "gradient shape {:?} does not match parameter shape {:?}",
                        grad.dims(),
                        shape
                    )));
                }
                Ok(grad.to_dtype(DType::F32)?)
            }
            Gradient::Sparse { indices, values } => {
                if shape.is_empty() || values.dims().get(1..) != shape.get(1..) {
                    return Err(FinetuneError::runtime(format!(
                        "sparse gradient rows {:?} do not match parameter shape {:?}",
                        values.dims(),
                        shape
                    )));
                }
                let indices = indices.flatten_all()?.to_dtype(DType::U32)?;
                let values = values.to_dtype(DType::F32)?;
                let zeros = Tensor::zeros(shape, DType::F32, values.device())?;
                Ok(zeros.index_add(&indices, &values, 0)?)
            }
        }
    }
}

/// Looks up the gradient of parameter `index`.
pub trait GradientSource {
    fn gradient(&self, index: usize, parameter: &Tensor) -> Option<Gradient>;
}

impl GradientSource for GradStore {
    fn gradient(&self, _index: usize, parameter: &Tensor) -> Option<Gradient> {
        self.get(parameter).cloned().map(Gradient::Dense)
    }
}

impl GradientSource for [Option<Gradient>] {
    fn gradient(&self, index: usize, _parameter: &Tensor) -> Option<Gradient> {
        self.get(index).cloned().flatten()
    }
}

impl GradientSource for Vec<Option<Gradient>> {
    fn gradient(&self, index: usize, parameter: &Tensor) -> Option<Gradient> {
        self.as_slice().gradient(index, parameter)
    }
}
