//! Loss functions
//!
//! The loops accept any [`LossFunction`]. The built-in [`LossType`]s cover the
//! regression losses used for genome prediction, and any closure of the form
//! `Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>` can be plugged in.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A differentiable scalar loss
pub trait LossFunction: Send + Sync {
    /// Reduce `predictions` against `targets` (same shape) to a scalar tensor
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor>;

    /// Short name used in logs
    fn name(&self) -> &str {
        "custom"
    }
}

/// Built-in losses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    /// Mean squared error
    Mse,
    /// Mean absolute error
    L1,
    /// Huber loss with a threshold of 1
    SmoothL1,
}

impl LossFunction for LossType {
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let loss = match self {
            LossType::Mse => candle_nn::loss::mse(predictions, targets)?,
            LossType::L1 => (predictions - targets)?.abs()?.mean_all()?,
            LossType::SmoothL1 => {
                // 0.5 * min(|d|, 1)^2 + (|d| - min(|d|, 1))
                let abs = (predictions - targets)?.abs()?;
                let clipped = abs.minimum(&abs.ones_like()?)?;
                let quadratic = clipped.sqr()?.affine(0.5, 0.0)?;
                let linear = (&abs - &clipped)?;
                (quadratic + linear)?.mean_all()?
            }
        };
        Ok(loss)
    }

    fn name(&self) -> &str {
        match self {
            LossType::Mse => "mse",
            LossType::L1 => "l1",
            LossType::SmoothL1 => "smooth_l1",
        }
    }
}

impl<F> LossFunction for F
where
    F: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        Ok(self(predictions, targets)?)
    }
}
