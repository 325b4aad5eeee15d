//! Epoch loop: train, validate, checkpoint
//!
//! The [`Orchestrator`] owns the model and the optimizer for the duration of a
//! run. Each epoch runs to completion, including its checkpoint save, before
//! the next one starts.

use std::fs;

use chrono::Utc;
use tracing::{info, instrument};

use super::checkpoints::CheckpointManager;
use super::loss::LossFunction;
use super::metrics::{EpochReport, RunSummary};
use super::optimizers::{Adam, Optimizer};
use super::trainer::{evaluate, train_epoch};
use crate::config::RunConfig;
use crate::data::{DataLoader, Dataset};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::network::{FracNet, NetworkConfig};

/// Drives a training run
pub struct Orchestrator {
    config: RunConfig,
    model: FracNet,
    optimizer: Adam,
    device: Box<dyn ComputeDevice>,
    checkpoints: CheckpointManager,
    loss: Box<dyn LossFunction>,
    next_epoch: usize,
}

impl Orchestrator {
    /// Create an orchestrator with a freshly initialised network
    pub fn new(
        config: RunConfig,
        network: NetworkConfig,
        device: Box<dyn ComputeDevice>,
    ) -> Result<Self> {
        config.validate()?;

        let model = FracNet::new(network, device.device())?;
        let optimizer = Adam::for_network(&model, config.optimizer.clone())?;
        let checkpoints = CheckpointManager::from_config(&config)?;
        let loss: Box<dyn LossFunction> = Box::new(config.training.loss);

        info!(
            "Orchestrator ready: experiment '{}', {} parameters on {}",
            config.experiment,
            model.num_parameters()?,
            device.tag()
        );

        Ok(Self {
            config,
            model,
            optimizer,
            device,
            checkpoints,
            loss,
            next_epoch: 0,
        })
    }

    /// Create an orchestrator whose output size and input shape are taken
    /// from the first sample of `dataset`
    pub fn from_dataset(
        config: RunConfig,
        dataset: &dyn Dataset,
        device: Box<dyn ComputeDevice>,
    ) -> Result<Self> {
        let network = network_for_dataset(&config, dataset)?;
        Self::new(config, network, device)
    }

    /// Replace the configured loss with any differentiable loss
    pub fn with_loss(mut self, loss: impl LossFunction + 'static) -> Self {
        self.loss = Box::new(loss);
        self
    }

    /// Restore model and optimizer from the record of `from_epoch`, scaling
    /// the stored learning rate by `lr_scale`. Subsequent [`run`](Self::run)
    /// calls continue at `from_epoch + 1`. On error the orchestrator is left
    /// unchanged.
    #[instrument(skip(self))]
    pub fn resume(&mut self, from_epoch: usize, lr_scale: f64) -> Result<f64> {
        let name = self.checkpoints.name(from_epoch);
        let restored = self.checkpoints.load(
            &name,
            self.device.as_ref(),
            self.model.config(),
            Some(lr_scale),
        )?;

        self.model = restored.model;
        self.optimizer = restored.optimizer;
        self.next_epoch = from_epoch + 1;

        info!(
            "Resumed from epoch {} at lr {:.3e}",
            from_epoch, restored.learning_rate
        );
        Ok(restored.learning_rate)
    }

    /// Train for `num_epochs` epochs, validating and checkpointing after each,
    /// then evaluate the test loader once. Writes `summary.json` into the
    /// experiment directory.
    pub fn run(
        &mut self,
        num_epochs: usize,
        train: &mut DataLoader,
        valid: &mut DataLoader,
        test: Option<&mut DataLoader>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let first = self.next_epoch;
        let mut epochs = Vec::with_capacity(num_epochs);

        for epoch in first..first + num_epochs {
            info!(
                "Epoch {} ({}/{})",
                epoch,
                epoch - first + 1,
                num_epochs
            );
            let learning_rate = self.optimizer.learning_rate();

            let train_metrics = train_epoch(
                &self.model,
                train,
                self.device.as_ref(),
                &mut self.optimizer,
                self.loss.as_ref(),
                self.config.training.log_every,
            )?;
            let validation = evaluate(&self.model, valid, self.device.as_ref(), self.loss.as_ref())?;

            let checkpoint = self.checkpoints.save(
                &self.checkpoints.name(epoch),
                &self.model,
                self.optimizer.learning_rate(),
                &self.optimizer,
                self.device.tag(),
            )?;
            self.next_epoch = epoch + 1;

            info!(
                "Epoch {} done: train loss {:.6}, valid loss {:.6}",
                epoch, train_metrics.loss, validation.loss
            );
            epochs.push(EpochReport {
                epoch,
                train: train_metrics,
                validation,
                learning_rate,
                checkpoint,
            });
        }

        let test = match test {
            Some(loader) => Some(evaluate(&self.model, loader, self.device.as_ref(), self.loss.as_ref())?),
            None => None,
        };

        let summary = RunSummary {
            experiment: self.config.experiment.clone(),
            num_functions: self.config.data.num_functions,
            device: self.device.tag().to_string(),
            epochs,
            test,
            final_learning_rate: self.optimizer.learning_rate(),
            started_at,
            finished_at: Utc::now(),
        };

        let dir = self.checkpoints.experiment_dir();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;

        Ok(summary)
    }

    /// Network being trained
    pub fn model(&self) -> &FracNet {
        &self.model
    }

    /// Optimizer bound to the network
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Checkpoint manager of the experiment
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Index the next trained epoch will get
    pub fn next_epoch(&self) -> usize {
        self.next_epoch
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }
}

/// Network configuration for `dataset`, discovering the label dimension and
/// input shape from its first sample
pub fn network_for_dataset(config: &RunConfig, dataset: &dyn Dataset) -> Result<NetworkConfig> {
    if dataset.is_empty() {
        return Err(Error::dataset(format!(
            "{} is empty, cannot infer the network shape",
            dataset.name()
        )));
    }
    let sample = dataset.get(0)?;
    let num_classes = sample.num_classes()?;
    let input_shape = sample.input_dims()?;
    info!(
        "Discovered {} outputs and input shape {:?} from {}",
        num_classes,
        input_shape,
        dataset.name()
    );
    NetworkConfig::from_model_config(&config.model, num_classes, input_shape)
}
