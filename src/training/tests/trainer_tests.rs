//! Tests for the training and evaluation loops

use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::data::{DataLoader, DataLoaderConfig, InMemoryDataset, Sample};
use crate::error::Error;
use crate::network::FracNet;
use crate::training::{evaluate, train_epoch, Adam, LossType, Optimizer};

use super::test_utils::{
    create_test_device, create_test_network, flat, synthetic_loader, INPUT_SHAPE, NUM_CLASSES,
};

fn setup() -> (FracNet, Adam) {
    let model = FracNet::new(create_test_network(), &Device::Cpu).unwrap();
    let optimizer = Adam::for_network(
        &model,
        crate::config::OptimizerConfig {
            learning_rate: 1e-2,
            ..Default::default()
        },
    )
    .unwrap();
    (model, optimizer)
}

fn loader_with_target_dim(target_dim: usize) -> DataLoader {
    let (c, h, w) = INPUT_SHAPE;
    let samples = (0..4)
        .map(|_| Sample {
            input: Tensor::zeros((c, h, w), candle_core::DType::F32, &Device::Cpu).unwrap(),
            target: Tensor::zeros(target_dim, candle_core::DType::F32, &Device::Cpu).unwrap(),
        })
        .collect();
    let config = DataLoaderConfig {
        batch_size: 2,
        shuffle: false,
        ..Default::default()
    };
    DataLoader::new(Arc::new(InMemoryDataset::new("wrong-targets", samples)), config).unwrap()
}

#[test]
fn test_training_pass_updates_parameters() {
    let (model, mut optimizer) = setup();
    let device = create_test_device();
    let mut loader = synthetic_loader(64, 1, 32);

    let before = model.state_dict().unwrap();
    let metrics = train_epoch(&model, &mut loader, &device, &mut optimizer, &LossType::Mse, 1).unwrap();
    let after = model.state_dict().unwrap();

    assert_eq!(metrics.num_batches, 2);
    assert_eq!(metrics.num_samples, 64);
    assert_eq!(metrics.steps, 2);
    assert!(metrics.loss.is_finite() && metrics.loss >= 0.0);

    let changed = before
        .iter()
        .filter(|(name, tensor)| flat(tensor) != flat(&after[*name]))
        .count();
    assert!(changed > 0, "no parameter changed during training");
}

#[test]
fn test_evaluation_is_idempotent() {
    let (model, mut optimizer) = setup();
    let device = create_test_device();
    let mut loader = synthetic_loader(40, 2, 16);

    let before = model.state_dict().unwrap();
    let first = evaluate(&model, &mut loader, &device, &LossType::Mse).unwrap();
    let second = evaluate(&model, &mut loader, &device, &LossType::Mse).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.num_samples, 40);
    assert_eq!(first.num_batches, 3);
    assert!(first.loss.is_finite() && first.loss >= 0.0);
    assert!((0.0..=1.0).contains(&first.accuracy));

    let after = model.state_dict().unwrap();
    super::assert_state_eq(&before, &after);
    assert_eq!(optimizer.step_count(), 0);

    // Still idempotent after the model has been trained
    let mut train = synthetic_loader(16, 3, 8);
    train_epoch(&model, &mut train, &device, &mut optimizer, &LossType::Mse, 10).unwrap();
    let third = evaluate(&model, &mut loader, &device, &LossType::Mse).unwrap();
    let fourth = evaluate(&model, &mut loader, &device, &LossType::Mse).unwrap();
    assert_eq!(third, fourth);
}

#[test]
fn test_evaluation_uses_inference_mode() {
    let mut config = create_test_network();
    config.dropout = 0.5;
    let model = FracNet::new(config, &Device::Cpu).unwrap();
    let device = create_test_device();
    let mut loader = synthetic_loader(8, 4, 8);

    let a = evaluate(&model, &mut loader, &device, &LossType::L1).unwrap();
    let b = evaluate(&model, &mut loader, &device, &LossType::L1).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_target_shape_mismatch_fails_loudly() {
    let (model, mut optimizer) = setup();
    let device = create_test_device();

    let mut loader = loader_with_target_dim(NUM_CLASSES + 1);
    let before = model.state_dict().unwrap();
    let result = train_epoch(&model, &mut loader, &device, &mut optimizer, &LossType::Mse, 1);
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    assert_eq!(optimizer.step_count(), 0);
    super::assert_state_eq(&before, &model.state_dict().unwrap());

    let mut loader = loader_with_target_dim(NUM_CLASSES - 1);
    let result = evaluate(&model, &mut loader, &device, &LossType::Mse);
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_input_shape_mismatch_fails_loudly() {
    let (model, mut optimizer) = setup();
    let device = create_test_device();

    let dataset = InMemoryDataset::synthetic(4, (1, 32, 32), NUM_CLASSES, 5).unwrap();
    let config = DataLoaderConfig {
        batch_size: 4,
        shuffle: false,
        ..Default::default()
    };
    let mut loader = DataLoader::new(Arc::new(dataset), config).unwrap();

    let result = train_epoch(&model, &mut loader, &device, &mut optimizer, &LossType::Mse, 1);
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_custom_loss_closure() {
    let (model, mut optimizer) = setup();
    let device = create_test_device();
    let mut loader = synthetic_loader(16, 6, 8);

    let sum_abs = |p: &Tensor, t: &Tensor| -> candle_core::Result<Tensor> {
        (p - t)?.abs()?.sum_all()
    };
    let metrics = train_epoch(&model, &mut loader, &device, &mut optimizer, &sum_abs, 1).unwrap();
    assert_eq!(metrics.num_batches, 2);
    assert!(metrics.loss > 0.0);
}
