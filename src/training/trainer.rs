//! Training and evaluation loops
//!
//! Both loops are plain functions over a model, a batch loader and a device
//! capability. Neither knows which concrete device, dataset or loss is in use.

use std::time::Instant;

use candle_core::Tensor;
use tracing::{debug, info, instrument};

use super::loss::LossFunction;
use super::metrics::{EvalAccumulator, EvalMetrics, TrainMetrics};
use super::optimizers::Optimizer;
use crate::data::{Batch, DataLoader};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::network::FracNet;

/// Move a batch onto the compute device
fn place_batch(batch: Batch, device: &dyn ComputeDevice) -> Result<(Tensor, Tensor)> {
    Ok((device.place(&batch.inputs)?, device.place(&batch.targets)?))
}

/// Predictions and targets must agree exactly; nothing is broadcast or cut
fn check_targets(predictions: &Tensor, targets: &Tensor) -> Result<()> {
    if predictions.dims() != targets.dims() {
        return Err(Error::shape_mismatch(predictions.dims(), targets.dims()));
    }
    Ok(())
}

/// Run one epoch of training over `loader`, updating the model in place.
///
/// Every batch goes through a training-mode forward pass, the loss, a backward
/// pass and one optimizer step. Gradients live only for the step that
/// produced them.
#[instrument(skip_all, fields(loss = loss_fn.name()))]
pub fn train_epoch(
    model: &FracNet,
    loader: &mut DataLoader,
    device: &dyn ComputeDevice,
    optimizer: &mut dyn Optimizer,
    loss_fn: &dyn LossFunction,
    log_every: usize,
) -> Result<TrainMetrics> {
    let start = Instant::now();
    let mut loss_sum = 0.0;
    let mut running_loss = 0.0;
    let mut num_samples = 0;
    let mut num_batches = 0;

    for batch in loader.epoch() {
        let (inputs, targets) = place_batch(batch?, device)?;
        let batch_size = inputs.dim(0)?;

        let predictions = model.forward_t(&inputs, true)?;
        check_targets(&predictions, &targets)?;

        let loss = loss_fn.compute(&predictions, &targets)?;
        let gradients = loss.backward()?;
        optimizer.step(&gradients)?;
        drop(gradients);

        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        loss_sum += loss_value * batch_size as f64;
        running_loss += loss_value;
        num_samples += batch_size;
        num_batches += 1;

        if log_every > 0 && num_batches % log_every == 0 {
            debug!(
                "[batch {}] running loss {:.6}, lr {:.3e}",
                num_batches,
                running_loss / log_every as f64,
                optimizer.learning_rate()
            );
            running_loss = 0.0;
        }
    }

    let metrics = TrainMetrics {
        loss: if num_samples == 0 {
            0.0
        } else {
            loss_sum / num_samples as f64
        },
        num_batches,
        num_samples,
        steps: optimizer.step_count(),
    };

    info!(
        "Training pass: {} batches, loss {:.6}, {:.1?}",
        metrics.num_batches,
        metrics.loss,
        start.elapsed()
    );
    Ok(metrics)
}

/// Measure the model over every batch of `loader` without touching its
/// parameters or any optimizer. Dropout is disabled and no gradients are
/// computed, so repeated calls on the same data give the same result.
#[instrument(skip_all, fields(loss = loss_fn.name()))]
pub fn evaluate(
    model: &FracNet,
    loader: &mut DataLoader,
    device: &dyn ComputeDevice,
    loss_fn: &dyn LossFunction,
) -> Result<EvalMetrics> {
    let mut acc = EvalAccumulator::default();

    for batch in loader.epoch() {
        let (inputs, targets) = place_batch(batch?, device)?;

        let predictions = model.forward(&inputs)?;
        check_targets(&predictions, &targets)?;

        let loss = loss_fn.compute(&predictions, &targets)?.to_scalar::<f32>()?;
        acc.add(f64::from(loss), &predictions, &targets)?;
    }

    let metrics = acc.finish();
    info!(
        "Evaluation on {}: loss {:.6}, mae {:.6}, accuracy {:.2}% ({} samples)",
        loader.dataset().name(),
        metrics.loss,
        metrics.mean_abs_error,
        metrics.accuracy * 100.0,
        metrics.num_samples
    );
    Ok(metrics)
}
