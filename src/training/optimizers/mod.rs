//! Optimizers for FracNet training
//!
//! Optimizer state is kept separate from the model parameters so it can be
//! checkpointed and restored on its own.

pub mod adam;

pub use adam::Adam;

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from the gradients of a backward pass
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Load optimizer state from checkpoint
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()>;

    /// Number of updates applied so far
    fn step_count(&self) -> usize;
}

/// Scalar part of an optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerHeader {
    /// Optimizer type
    pub optimizer_type: String,
    /// Current step count
    pub step_count: usize,
    /// Current learning rate
    pub learning_rate: f64,
    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, f64>,
}

/// Optimizer state dictionary for checkpointing
#[derive(Debug, Clone)]
pub struct OptimizerStateDict {
    /// Scalars
    pub header: OptimizerHeader,
    /// Per-parameter state tensors, keyed `<parameter>.<slot>`
    pub tensors: BTreeMap<String, Tensor>,
}
