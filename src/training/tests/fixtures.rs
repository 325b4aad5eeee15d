//! Test fixtures for setting up common test scenarios

use tempfile::TempDir;

use crate::config::RunConfig;
use crate::device::{ComputeDevice, SingleDevice};
use crate::network::FracNet;
use crate::training::{train_epoch, Adam, CheckpointManager, LossType};

use super::test_utils::{create_test_config, create_test_device, create_test_network, synthetic_loader};

/// A model and optimizer with non-trivial state plus a checkpoint manager
/// rooted in a temporary directory
pub struct CheckpointTestFixture {
    pub temp_dir: TempDir,
    pub config: RunConfig,
    pub device: SingleDevice,
    pub manager: CheckpointManager,
    pub model: FracNet,
    pub optimizer: Adam,
}

impl CheckpointTestFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = create_test_config(temp_dir.path());
        let device = create_test_device();
        let manager = CheckpointManager::from_config(&config).expect("manager");

        let model = FracNet::new(create_test_network(), device.device()).expect("model");
        let optimizer = Adam::for_network(&model, config.optimizer.clone()).expect("optimizer");

        Self {
            temp_dir,
            config,
            device,
            manager,
            model,
            optimizer,
        }
    }

    /// Run one training pass so parameters and moments are no longer at
    /// their initial values
    pub fn trained(mut self) -> Self {
        let mut loader = synthetic_loader(16, 7, 8);
        train_epoch(
            &self.model,
            &mut loader,
            &self.device,
            &mut self.optimizer,
            &LossType::Mse,
            10,
        )
        .expect("training pass");
        self
    }
}
