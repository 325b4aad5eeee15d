//! Tests for the orchestrated epoch loop

use candle_core::Tensor;
use tempfile::TempDir;

use crate::data::InMemoryDataset;
use crate::error::Error;
use crate::training::{network_for_dataset, Optimizer, Orchestrator, RunSummary};

use super::test_utils::{
    assert_state_eq, create_test_config, create_test_device, synthetic_loader, INPUT_SHAPE,
    NUM_CLASSES,
};

fn orchestrator(dir: &TempDir) -> Orchestrator {
    let config = create_test_config(dir.path());
    let dataset = InMemoryDataset::synthetic(4, INPUT_SHAPE, NUM_CLASSES, 0).unwrap();
    Orchestrator::from_dataset(config, &dataset, Box::new(create_test_device())).unwrap()
}

#[test]
fn test_shape_discovered_from_first_sample() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path());
    let dataset = InMemoryDataset::synthetic(2, (3, 24, 40), 16, 0).unwrap();

    let network = network_for_dataset(&config, &dataset).unwrap();
    assert_eq!(network.num_classes, 16);
    assert_eq!(network.input_shape.dims(), (3, 24, 40));
    assert_eq!(network.branches, config.model.branches);

    let empty = InMemoryDataset::new("empty", Vec::new());
    assert!(matches!(
        network_for_dataset(&config, &empty),
        Err(Error::Dataset(_))
    ));
}

#[test]
fn test_run_writes_checkpoints_and_summary() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&dir);

    let mut train = synthetic_loader(32, 1, 16);
    let mut valid = synthetic_loader(16, 2, 16);
    let mut test = synthetic_loader(8, 3, 16);
    let summary = orchestrator
        .run(2, &mut train, &mut valid, Some(&mut test))
        .unwrap();

    assert_eq!(summary.epochs.len(), 2);
    assert_eq!(orchestrator.next_epoch(), 2);
    for (i, report) in summary.epochs.iter().enumerate() {
        assert_eq!(report.epoch, i);
        assert!(report.checkpoint.is_file());
        assert_eq!(report.train.num_batches, 2);
        assert_eq!(report.validation.num_samples, 16);
    }
    assert_eq!(summary.test.as_ref().map(|m| m.num_samples), Some(8));

    let summary_path = orchestrator.checkpoints().experiment_dir().join("summary.json");
    let written = std::fs::read_to_string(summary_path).unwrap();
    let parsed: RunSummary = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed.epochs.len(), 2);
    assert_eq!(parsed.experiment, "unit");
}

#[test]
fn test_resume_continues_numbering() {
    let dir = TempDir::new().unwrap();
    let mut first = orchestrator(&dir);
    let mut train = synthetic_loader(16, 1, 16);
    let mut valid = synthetic_loader(16, 2, 16);
    first.run(2, &mut train, &mut valid, None).unwrap();
    let stored_lr = first.optimizer().learning_rate();

    let mut second = orchestrator(&dir);
    let lr = second.resume(0, 0.5).unwrap();
    assert_eq!(lr, stored_lr * 0.5);
    assert_eq!(second.optimizer().learning_rate(), lr);
    assert_eq!(second.next_epoch(), 1);

    let summary = second.run(2, &mut train, &mut valid, None).unwrap();
    let epochs: Vec<usize> = summary.epochs.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![1, 2]);
    assert_eq!(summary.epochs[0].learning_rate, lr);

    let listed: Vec<usize> = second
        .checkpoints()
        .list()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name.epoch)
        .collect();
    assert_eq!(listed, vec![0, 1, 2]);
}

#[test]
fn test_failed_resume_leaves_state_unchanged() {
    let dir = TempDir::new().unwrap();
    let mut orchestrator = orchestrator(&dir);
    let before = orchestrator.model().state_dict().unwrap();

    assert!(matches!(
        orchestrator.resume(4, 1.0),
        Err(Error::CheckpointNotFound { .. })
    ));
    assert_eq!(orchestrator.next_epoch(), 0);
    assert_eq!(orchestrator.optimizer().learning_rate(), 1e-2);
    assert_eq!(orchestrator.optimizer().step_count(), 0);
    assert_state_eq(&before, &orchestrator.model().state_dict().unwrap());
}

#[test]
fn test_custom_loss() {
    let dir = TempDir::new().unwrap();
    let sum_of_squares = |p: &Tensor, t: &Tensor| -> candle_core::Result<Tensor> {
        (p - t)?.sqr()?.sum_all()
    };
    let mut orchestrator = orchestrator(&dir).with_loss(sum_of_squares);
    let mut train = synthetic_loader(8, 1, 8);
    let mut valid = synthetic_loader(8, 2, 8);
    let summary = orchestrator.run(1, &mut train, &mut valid, None).unwrap();
    assert!(summary.epochs[0].validation.loss > 0.0);
}
