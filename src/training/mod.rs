//! Training infrastructure for FracNet models
//!
//! # Main Components
//!
//! - **Loss**: built-in regression losses and pluggable loss closures
//! - **Optimizers**: Adam with checkpointable moment state
//! - **Trainer**: one-epoch training loop and the side-effect free evaluation loop
//! - **Checkpoints**: atomic per-epoch records with learning-rate scaled restore
//! - **Orchestrator**: the epoch loop tying the above together
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use fracnet::training::Orchestrator;
//! use fracnet::device::SingleDevice;
//!
//! let mut orchestrator = Orchestrator::from_dataset(config, train_set.as_ref(), Box::new(SingleDevice::cpu()))?;
//! let summary = orchestrator.run(2, &mut train_loader, &mut valid_loader, Some(&mut test_loader))?;
//! ```

pub mod checkpoints;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod orchestrator;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

pub use checkpoints::{CheckpointManager, CheckpointMetadata, CheckpointName, RestoredState};
pub use loss::{LossFunction, LossType};
pub use metrics::{EpochReport, EvalMetrics, RunSummary, TrainMetrics};
pub use optimizers::{Adam, Optimizer, OptimizerHeader, OptimizerStateDict};
pub use orchestrator::{network_for_dataset, Orchestrator};
pub use trainer::{evaluate, train_epoch};
