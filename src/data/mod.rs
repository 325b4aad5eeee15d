//! Data loading infrastructure
//!
//! This module provides the dataset abstraction, the fractal generator and
//! dataset reader, per-sample transforms, batch collation and the
//! epoch-restartable batch loader that feeds the training and evaluation
//! loops.

use candle_core::Tensor;

use crate::error::Result;

pub mod batching;
pub mod datasets;
pub mod generator;
pub mod loaders;

pub use batching::{collate, Batch};
pub use datasets::{
    FractalDataset, FractalRecord, FractalStats, InMemoryDataset, RawSample, ToTensor, Transform,
};
pub use generator::{generate_fractals, GeneratorConfig, IfsGenome};
pub use loaders::{DataLoader, DataLoaderConfig, EpochIter};

/// Common trait for all datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<Sample>;

    /// Human readable dataset name used in logs
    fn name(&self) -> &str;
}

/// A single input/label pair
#[derive(Debug, Clone)]
pub struct Sample {
    /// Input tensor, `(channels, height, width)`
    pub input: Tensor,
    /// Target vector, `(num_classes,)`
    pub target: Tensor,
}

impl Sample {
    /// Input shape as `(channels, height, width)`
    pub fn input_dims(&self) -> Result<(usize, usize, usize)> {
        Ok(self.input.dims3()?)
    }

    /// Label dimensionality
    pub fn num_classes(&self) -> Result<usize> {
        Ok(self.target.dims1()?)
    }
}
