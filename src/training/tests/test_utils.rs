//! Common utilities for testing the training pipeline

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::Tensor;

use crate::config::{DataConfig, ModelConfig, OptimizerConfig, RunConfig, TrainingParams};
use crate::data::{DataLoader, DataLoaderConfig, InMemoryDataset};
use crate::device::SingleDevice;
use crate::network::{BranchConfig, NetworkConfig};

/// Input shape used throughout the tests
pub const INPUT_SHAPE: (usize, usize, usize) = (3, 32, 32);

/// Label dimension used throughout the tests
pub const NUM_CLASSES: usize = 5;

/// Create a test device (CPU for CI compatibility)
pub fn create_test_device() -> SingleDevice {
    SingleDevice::cpu()
}

fn test_branches() -> Vec<BranchConfig> {
    vec![
        BranchConfig {
            width: 3,
            kernel_size: 3,
            pool_size: 8,
        },
        BranchConfig {
            width: 5,
            kernel_size: 5,
            pool_size: 4,
        },
    ]
}

/// Small two-branch network over [`INPUT_SHAPE`]
pub fn create_test_network() -> NetworkConfig {
    NetworkConfig::new(NUM_CLASSES, 0.0, INPUT_SHAPE, test_branches())
        .expect("test network config is valid")
}

/// Minimal run configuration writing checkpoints under `output_dir`
pub fn create_test_config(output_dir: &Path) -> RunConfig {
    let mut config = RunConfig {
        experiment: "unit".to_string(),
        data: DataConfig {
            batch_size: 32,
            num_workers: 0,
            ..Default::default()
        },
        model: ModelConfig {
            dropout: 0.0,
            branches: test_branches(),
        },
        optimizer: OptimizerConfig {
            learning_rate: 1e-2,
            ..Default::default()
        },
        training: TrainingParams {
            num_epochs: 2,
            log_every: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    config.checkpointing.output_dir = output_dir.to_path_buf();
    config
}

/// Sequential loader over a synthetic dataset of `len` samples
pub fn synthetic_loader(len: usize, seed: u64, batch_size: usize) -> DataLoader {
    let dataset = InMemoryDataset::synthetic(len, INPUT_SHAPE, NUM_CLASSES, seed)
        .expect("synthetic dataset");
    let config = DataLoaderConfig {
        batch_size,
        shuffle: false,
        num_workers: 0,
        drop_last: false,
        seed,
    };
    DataLoader::new(Arc::new(dataset), config).expect("loader")
}

/// Flatten a tensor into its values
pub fn flat(tensor: &Tensor) -> Vec<f32> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .expect("f32 tensor")
}

/// Assert two parameter mappings hold the same names and identical values
pub fn assert_state_eq(a: &BTreeMap<String, Tensor>, b: &BTreeMap<String, Tensor>) {
    assert_eq!(
        a.keys().collect::<Vec<_>>(),
        b.keys().collect::<Vec<_>>(),
        "parameter names differ"
    );
    for (name, tensor) in a {
        assert_eq!(tensor.dims(), b[name].dims(), "{name} shape differs");
        assert_eq!(flat(tensor), flat(&b[name]), "{name} values differ");
    }
}
