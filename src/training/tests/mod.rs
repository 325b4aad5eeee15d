//! Test suite for the training pipeline
//!
//! Covers the training and evaluation loops, checkpoint records and the
//! orchestrated epoch loop on small synthetic data.

pub mod orchestrator_tests;
pub mod trainer_tests;

// Utility modules for testing
pub mod fixtures;
pub mod test_utils;

pub use fixtures::CheckpointTestFixture;
pub use test_utils::{
    assert_state_eq, create_test_config, create_test_device, create_test_network, flat,
    synthetic_loader,
};
