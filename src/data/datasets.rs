//! Dataset implementations
//!
//! [`FractalDataset`] reads the descriptor written by the fractal generator
//! (`fracdata.dat`, one tab-separated row per fractal) and the matching
//! `frac<N>.png` images. [`InMemoryDataset`] holds ready-made samples.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument};

use super::{Dataset, Sample};
use crate::config::{DataConfig, Split};
use crate::error::{Error, Result};

/// Leading summary columns before the genome
const SUMMARY_COLUMNS: usize = 9;

/// Genome values per IFS function: 4 multipliers, 2 translations,
/// 1 probability, 1 spectral radius
const GENOME_VALUES_PER_FUNCTION: usize = 8;

/// Pixel record before conversion to tensors, stored row-major HWC
#[derive(Debug, Clone)]
pub struct RawSample {
    /// Interleaved pixel bytes
    pub pixels: Vec<u8>,
    /// Image height
    pub height: usize,
    /// Image width
    pub width: usize,
    /// Channels per pixel
    pub channels: usize,
    /// Label vector
    pub label: Vec<f32>,
}

/// Per-sample conversion hook
pub trait Transform: Send + Sync {
    /// Turn a raw record into a sample
    fn apply(&self, raw: RawSample) -> Result<Sample>;
}

/// Converts HWC bytes into a CHW `f32` tensor scaled to `[0, 1]`
#[derive(Debug, Clone, Copy, Default)]
pub struct ToTensor;

impl Transform for ToTensor {
    fn apply(&self, raw: RawSample) -> Result<Sample> {
        let expected = raw.height * raw.width * raw.channels;
        if raw.pixels.len() != expected {
            return Err(Error::shape_mismatch(
                (raw.height, raw.width, raw.channels),
                raw.pixels.len(),
            ));
        }

        let data: Vec<f32> = raw.pixels.iter().map(|&p| p as f32 / 255.0).collect();
        let input = Tensor::from_vec(data, (raw.height, raw.width, raw.channels), &Device::Cpu)?
            .permute((2, 0, 1))?
            .contiguous()?;
        let num_classes = raw.label.len();
        let target = Tensor::from_vec(raw.label, num_classes, &Device::Cpu)?;

        Ok(Sample { input, target })
    }
}

/// Summary statistics written alongside each fractal
#[derive(Debug, Clone, PartialEq)]
pub struct FractalStats {
    /// Number of points that fell inside the viewing window
    pub numb: i64,
    /// Mean x pixel coordinate
    pub avg_x: i64,
    /// Mean y pixel coordinate
    pub avg_y: i64,
    /// Standard deviation in x
    pub stddev_x: f64,
    /// Standard deviation in y
    pub stddev_y: f64,
    /// Estimated fractal dimension
    pub dimension: f64,
}

/// One descriptor row
#[derive(Debug, Clone, PartialEq)]
pub struct FractalRecord {
    /// Fractal number, names the image `frac<index>.png`
    pub index: usize,
    /// Functions in the IFS
    pub num_functions: usize,
    /// Points iterated to draw the fractal
    pub num_points: usize,
    /// Summary statistics
    pub stats: FractalStats,
    /// Genome, the regression target
    pub genome: Vec<f32>,
}

impl FractalRecord {
    /// Parse a tab-separated descriptor line; `row` is used in error messages
    pub fn parse(line: &str, row: usize) -> Result<Self> {
        let fields: Vec<&str> = line
            .split('\t')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect();

        if fields.len() < SUMMARY_COLUMNS {
            return Err(Error::dataset(format!(
                "row {row}: expected at least {SUMMARY_COLUMNS} columns, found {}",
                fields.len()
            )));
        }

        let int = |col: usize| -> Result<i64> {
            fields[col].parse::<i64>().map_err(|e| {
                Error::dataset(format!("row {row}, column {col}: '{}': {e}", fields[col]))
            })
        };
        let float = |col: usize| -> Result<f64> {
            fields[col].parse::<f64>().map_err(|e| {
                Error::dataset(format!("row {row}, column {col}: '{}': {e}", fields[col]))
            })
        };
        let count = |col: usize| -> Result<usize> {
            usize::try_from(int(col)?).map_err(|_| {
                Error::dataset(format!("row {row}, column {col}: negative count"))
            })
        };

        let index = count(0)?;
        let num_functions = count(1)?;
        if num_functions == 0 {
            return Err(Error::dataset(format!("row {row}: IFS has no functions")));
        }

        let genome_len = GENOME_VALUES_PER_FUNCTION * num_functions;
        if fields.len() != SUMMARY_COLUMNS + genome_len {
            return Err(Error::dataset(format!(
                "row {row}: {num_functions} functions need {genome_len} genome values, found {}",
                fields.len() - SUMMARY_COLUMNS
            )));
        }

        let genome = (SUMMARY_COLUMNS..fields.len())
            .map(|col| float(col).map(|v| v as f32))
            .collect::<Result<Vec<f32>>>()?;

        Ok(Self {
            index,
            num_functions,
            num_points: count(2)?,
            stats: FractalStats {
                numb: int(3)?,
                avg_x: int(4)?,
                avg_y: int(5)?,
                stddev_x: float(6)?,
                stddev_y: float(7)?,
                dimension: float(8)?,
            },
            genome,
        })
    }
}

/// Fractal images labelled by their IFS genome
pub struct FractalDataset {
    name: String,
    root_dir: PathBuf,
    records: Vec<FractalRecord>,
    transform: Box<dyn Transform>,
}

impl FractalDataset {
    /// Read a descriptor file; images are resolved against `root_dir`
    #[instrument(skip(descriptor, root_dir, transform))]
    pub fn new(
        descriptor: impl AsRef<Path>,
        root_dir: impl Into<PathBuf>,
        transform: Box<dyn Transform>,
    ) -> Result<Self> {
        let descriptor = descriptor.as_ref();
        let root_dir = root_dir.into();
        let content = std::fs::read_to_string(descriptor).map_err(|e| {
            Error::dataset(format!("cannot read descriptor {}: {e}", descriptor.display()))
        })?;

        let records = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(row, line)| FractalRecord::parse(line, row))
            .collect::<Result<Vec<_>>>()?;

        if let Some(first) = records.first() {
            if let Some(bad) = records
                .iter()
                .find(|r| r.num_functions != first.num_functions)
            {
                return Err(Error::dataset(format!(
                    "fractal {} has {} functions but fractal {} has {}",
                    bad.index, bad.num_functions, first.index, first.num_functions
                )));
            }
        }

        info!(
            "Loaded {} fractal records from {}",
            records.len(),
            descriptor.display()
        );

        Ok(Self {
            name: root_dir.display().to_string(),
            root_dir,
            records,
            transform,
        })
    }

    /// Open one split of the configured data root with [`ToTensor`]
    pub fn from_split(config: &DataConfig, split: Split) -> Result<Self> {
        Self::new(
            config.descriptor_path(split),
            config.split_dir(split),
            Box::new(ToTensor),
        )
    }

    /// Parsed descriptor rows
    pub fn records(&self) -> &[FractalRecord] {
        &self.records
    }

    fn image_path(&self, record: &FractalRecord) -> PathBuf {
        self.root_dir.join(format!("frac{}.png", record.index))
    }
}

impl Dataset for FractalDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let record = self.records.get(index).ok_or_else(|| {
            Error::dataset(format!(
                "index {index} out of range for {} samples",
                self.records.len()
            ))
        })?;

        let path = self.image_path(record);
        if !path.exists() {
            return Err(Error::dataset(format!("missing image {}", path.display())));
        }
        debug!("Reading {}", path.display());

        let image = image::open(&path)?.to_rgb8();
        let (width, height) = image.dimensions();
        let raw = RawSample {
            pixels: image.into_raw(),
            height: height as usize,
            width: width as usize,
            channels: 3,
            label: record.genome.clone(),
        };
        self.transform.apply(raw)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Samples held in memory
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    name: String,
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    /// Wrap existing samples
    pub fn new(name: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    /// Random inputs in `[0, 1)` with one-hot targets, reproducible from `seed`
    pub fn synthetic(
        len: usize,
        input_shape: (usize, usize, usize),
        num_classes: usize,
        seed: u64,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::config("num_classes must be > 0"));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let (c, h, w) = input_shape;

        let samples = (0..len)
            .map(|_| -> Result<Sample> {
                let pixels: Vec<f32> = (0..c * h * w).map(|_| rng.random::<f32>()).collect();
                let class = rng.random_range(0..num_classes);
                let mut label = vec![0f32; num_classes];
                label[class] = 1.0;
                Ok(Sample {
                    input: Tensor::from_vec(pixels, (c, h, w), &Device::Cpu)?,
                    target: Tensor::from_vec(label, num_classes, &Device::Cpu)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(format!("synthetic-{seed}"), samples))
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            Error::dataset(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
