use serde::{Deserialize, Serialize};

pub const LOSS_AVERAGE_DECAY: f64 = 0.99;

/// Bias-corrected exponential moving average of a loss.
///
/// Both the accumulated value and its weight decay by [`LOSS_AVERAGE_DECAY`]
/// on every update, so early readings are not pulled towards zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossAverage {
    value: f64,
    weight: f64,
}

impl LossAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in `loss` and returns the new average.
    pub fn update(&mut self, loss: f64) -> f64 {
        self.value = self.value * LOSS_AVERAGE_DECAY + loss;
        self.weight = self.weight * LOSS_AVERAGE_DECAY + 1.0;
        self.value / self.weight
    }

    /// `None` until the first update.
    pub fn average(&self) -> Option<f64> {
        if self.weight > 0.0 {
            Some(self.value / self.weight)
        } else {
            None
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_returns_the_sample() {
        let mut avg = LossAverage::new();
        assert_eq!(avg.average(), None);
        assert!((avg.update(3.5) - 3.5).abs() < 1e-12);
    }

    #[test]
    fn matches_reference_recurrence() {
        let mut avg = LossAverage::new();
        avg.update(2.0);
        let result = avg.update(4.0);
        let expected = (2.0 * 0.99 + 4.0) / (0.99 + 1.0);
        assert!((result - expected).abs() < 1e-12);
        assert!((avg.weight() - 1.99).abs() < 1e-12);
    }
}
