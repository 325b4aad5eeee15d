//! Metrics produced by the training and evaluation loops

use std::path::PathBuf;

use candle_core::{DType, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Summary of one training pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    /// Sample-weighted mean training loss
    pub loss: f64,
    /// Batches consumed
    pub num_batches: usize,
    /// Samples consumed
    pub num_samples: usize,
    /// Optimizer steps taken since the optimizer was created or restored
    pub steps: usize,
}

/// Aggregate quality of the model over a held-out batch source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Sample-weighted mean loss
    pub loss: f64,
    /// Mean absolute error over every predicted value
    pub mean_abs_error: f64,
    /// Fraction of samples whose predicted argmax matches the target argmax
    pub accuracy: f64,
    /// Samples evaluated
    pub num_samples: usize,
    /// Batches evaluated
    pub num_batches: usize,
}

/// Running sums behind [`EvalMetrics`]
#[derive(Debug, Default)]
pub(crate) struct EvalAccumulator {
    loss_sum: f64,
    abs_error_sum: f64,
    num_values: usize,
    correct: usize,
    num_samples: usize,
    num_batches: usize,
}

impl EvalAccumulator {
    /// Fold in one batch. `loss` is the batch mean.
    pub(crate) fn add(&mut self, loss: f64, predictions: &Tensor, targets: &Tensor) -> Result<()> {
        let batch = predictions.dim(0)?;

        let abs_error = (predictions - targets)?
            .abs()?
            .to_dtype(DType::F64)?
            .sum_all()?
            .to_scalar::<f64>()?;

        let correct = predictions
            .argmax(1)?
            .eq(&targets.argmax(1)?)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;

        self.loss_sum += loss * batch as f64;
        self.abs_error_sum += abs_error;
        self.num_values += predictions.elem_count();
        self.correct += correct as usize;
        self.num_samples += batch;
        self.num_batches += 1;
        Ok(())
    }

    pub(crate) fn finish(self) -> EvalMetrics {
        let per = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };
        EvalMetrics {
            loss: per(self.loss_sum, self.num_samples),
            mean_abs_error: per(self.abs_error_sum, self.num_values),
            accuracy: per(self.correct as f64, self.num_samples),
            num_samples: self.num_samples,
            num_batches: self.num_batches,
        }
    }
}

/// Outcome of one orchestrated epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochReport {
    /// Epoch index
    pub epoch: usize,
    /// Training pass
    pub train: TrainMetrics,
    /// Validation pass
    pub validation: EvalMetrics,
    /// Learning rate in effect during the epoch
    pub learning_rate: f64,
    /// Checkpoint record written after the epoch
    pub checkpoint: PathBuf,
}

/// Everything a run produced, written as `summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Experiment identifier
    pub experiment: String,
    /// Functions per IFS of the dataset
    pub num_functions: usize,
    /// Device tag used for the run
    pub device: String,
    /// Per-epoch results in order
    pub epochs: Vec<EpochReport>,
    /// Test-set evaluation after the last epoch
    pub test: Option<EvalMetrics>,
    /// Learning rate at the end of the run
    pub final_learning_rate: f64,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_accumulator_weights_by_samples() {
        let mut acc = EvalAccumulator::default();

        let p1 = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let t1 = Tensor::new(&[[1.0f32, 0.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        acc.add(1.0, &p1, &t1).unwrap();

        let p2 = Tensor::new(&[[0.5f32, 0.0]], &Device::Cpu).unwrap();
        let t2 = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        acc.add(4.0, &p2, &t2).unwrap();

        let metrics = acc.finish();
        assert_eq!(metrics.num_samples, 3);
        assert_eq!(metrics.num_batches, 2);
        assert_relative_eq!(metrics.loss, (2.0 + 4.0) / 3.0);
        // |0|+|0|+|1|+|1| + |0.5|+|0| over 6 values
        assert_relative_eq!(metrics.mean_abs_error, 2.5 / 6.0);
        assert_relative_eq!(metrics.accuracy, 2.0 / 3.0);
    }

    #[test]
    fn test_empty_accumulator() {
        let metrics = EvalAccumulator::default().finish();
        assert_eq!(metrics.num_samples, 0);
        assert_eq!(metrics.loss, 0.0);
        assert_eq!(metrics.accuracy, 0.0);
    }
}
