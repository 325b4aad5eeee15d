//! FracNet - multi-branch CNN training on IFS fractal images
//!
//! This crate trains a configurable convolutional network with parallel
//! branches on a dataset of rendered iterated-function-system fractals, with
//! per-epoch validation, atomic checkpoints and learning-rate scaled resume.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod network;
pub mod training;

// Re-exports
pub use config::{RunConfig, Split};
pub use data::{DataLoader, DataLoaderConfig, Dataset, FractalDataset, InMemoryDataset, Sample};
pub use device::{select_device, ComputeDevice, SingleDevice};
pub use error::{Error, Result};
pub use network::{BranchConfig, FracNet, InputShape, NetworkConfig};
pub use training::{
    CheckpointManager, CheckpointName, EvalMetrics, LossFunction, LossType, Orchestrator,
    RunSummary, TrainMetrics,
};
