//! Batch loader with per-epoch shuffling and parallel sample fetching

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{collate, Batch, Dataset, Sample};
use crate::config::DataConfig;
use crate::error::{Error, Result};

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to reshuffle the data every epoch
    pub shuffle: bool,
    /// Number of worker threads fetching samples (0 loads on the caller)
    pub num_workers: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Seed of the shuffling RNG
    pub seed: u64,
}

impl DataLoaderConfig {
    /// Training loader settings from the run configuration
    pub fn training(data: &DataConfig, seed: u64) -> Self {
        Self {
            batch_size: data.batch_size,
            shuffle: data.shuffle_train,
            num_workers: data.num_workers,
            drop_last: data.drop_last,
            seed,
        }
    }

    /// Sequential loader settings for validation and test sets
    pub fn evaluation(data: &DataConfig) -> Self {
        Self {
            batch_size: data.batch_size,
            shuffle: false,
            num_workers: data.num_workers,
            drop_last: false,
            seed: 0,
        }
    }
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            num_workers: 0,
            drop_last: false,
            seed: 42,
        }
    }
}

/// Restartable source of mini-batches over a dataset
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    pool: Option<ThreadPool>,
    rng: StdRng,
    epoch: usize,
}

impl DataLoader {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<dyn Dataset>, config: DataLoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }

        let pool = if config.num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.num_workers)
                    .thread_name(|i| format!("fracnet-loader-{i}"))
                    .build()
                    .map_err(|e| Error::internal(format!("cannot start loader workers: {e}")))?,
            )
        } else {
            None
        };

        info!(
            "Creating DataLoader for {} with batch_size={}, num_workers={}, shuffle={}",
            dataset.name(),
            config.batch_size,
            config.num_workers,
            config.shuffle
        );

        Ok(Self {
            dataset,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            pool,
            epoch: 0,
        })
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let size = self.dataset.len();
        if self.config.drop_last {
            size / self.config.batch_size
        } else {
            size.div_ceil(self.config.batch_size)
        }
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Get the configured batch size
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// Number of epochs started so far
    pub fn epochs_started(&self) -> usize {
        self.epoch
    }

    /// Start a new pass over the dataset. Shuffled loaders draw a fresh order.
    pub fn epoch(&mut self) -> EpochIter<'_> {
        self.epoch += 1;

        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            indices.shuffle(&mut self.rng);
        }

        let batches: Vec<Vec<usize>> = indices
            .chunks(self.config.batch_size)
            .filter(|chunk| !self.config.drop_last || chunk.len() == self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        debug!(
            "Epoch {} of {}: {} batches",
            self.epoch,
            self.dataset.name(),
            batches.len()
        );

        EpochIter {
            dataset: self.dataset.as_ref(),
            pool: self.pool.as_ref(),
            batches: batches.into_iter(),
        }
    }
}

/// Lazy iterator over the batches of one epoch
pub struct EpochIter<'a> {
    dataset: &'a dyn Dataset,
    pool: Option<&'a ThreadPool>,
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl EpochIter<'_> {
    fn load(&self, indices: &[usize]) -> Result<Batch> {
        let dataset = self.dataset;
        let samples = match self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| dataset.get(i))
                    .collect::<Result<Vec<Sample>>>()
            })?,
            None => indices
                .iter()
                .map(|&i| dataset.get(i))
                .collect::<Result<Vec<Sample>>>()?,
        };
        collate(samples)
    }
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        Some(self.load(&indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

impl ExactSizeIterator for EpochIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryDataset;
    use candle_core::{Device, Tensor};

    /// Dataset whose sample `i` has input filled with `i`
    fn indexed_dataset(len: usize) -> Arc<dyn Dataset> {
        let samples = (0..len)
            .map(|i| Sample {
                input: Tensor::full(i as f32, (1, 2, 2), &Device::Cpu).unwrap(),
                target: Tensor::full(i as f32, 3, &Device::Cpu).unwrap(),
            })
            .collect();
        Arc::new(InMemoryDataset::new("indexed", samples))
    }

    fn epoch_order(loader: &mut DataLoader) -> Vec<usize> {
        loader
            .epoch()
            .flat_map(|batch| {
                let batch = batch.unwrap();
                batch
                    .targets
                    .to_vec2::<f32>()
                    .unwrap()
                    .into_iter()
                    .map(|row| row[0] as usize)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_sequential_order_is_fixed() {
        let config = DataLoaderConfig {
            batch_size: 4,
            shuffle: false,
            ..Default::default()
        };
        let mut loader = DataLoader::new(indexed_dataset(10), config).unwrap();
        assert_eq!(loader.num_batches(), 3);
        assert_eq!(loader.dataset_size(), 10);
        assert_eq!(loader.batch_size(), 4);
        assert_eq!(loader.epochs_started(), 0);

        let first = epoch_order(&mut loader);
        let second = epoch_order(&mut loader);
        assert_eq!(first, (0..10).collect::<Vec<_>>());
        assert_eq!(first, second);
        assert_eq!(loader.epochs_started(), 2);
    }

    #[test]
    fn test_shuffle_redraws_each_epoch() {
        let config = DataLoaderConfig {
            batch_size: 8,
            shuffle: true,
            seed: 3,
            ..Default::default()
        };
        let mut loader = DataLoader::new(indexed_dataset(64), config).unwrap();

        let first = epoch_order(&mut loader);
        let second = epoch_order(&mut loader);
        assert_ne!(first, second);

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_last_and_remainder() {
        let mut config = DataLoaderConfig {
            batch_size: 4,
            shuffle: false,
            ..Default::default()
        };
        let mut loader = DataLoader::new(indexed_dataset(10), config.clone()).unwrap();
        let sizes: Vec<usize> = loader.epoch().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        config.drop_last = true;
        let mut loader = DataLoader::new(indexed_dataset(10), config).unwrap();
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.epoch().len(), 2);
    }

    #[test]
    fn test_workers_preserve_batch_order() {
        let config = DataLoaderConfig {
            batch_size: 5,
            shuffle: false,
            num_workers: 3,
            ..Default::default()
        };
        let mut loader = DataLoader::new(indexed_dataset(12), config).unwrap();
        assert_eq!(epoch_order(&mut loader), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = DataLoaderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            DataLoader::new(indexed_dataset(1), config),
            Err(Error::Config(_))
        ));
    }
}
