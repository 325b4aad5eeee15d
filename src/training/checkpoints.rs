//! Checkpoint records
//!
//! One safetensors file per `(experiment, num_functions, epoch)`:
//!
//! ```text
//! <output_dir>/<experiment>/model_nf<nf>_<epoch>.<ext>
//! ```
//!
//! Model parameters are stored under `model.<name>`, optimizer moments under
//! `optim.<name>.<slot>`. Scalars (learning rate, device tag, network and
//! optimizer configuration) go into the safetensors metadata header. Records
//! are written to a temporary sibling and renamed into place, so an
//! interrupted save never damages an earlier record of the same name.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use chrono::{DateTime, Utc};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::optimizers::{Adam, Optimizer, OptimizerHeader, OptimizerStateDict};
use crate::config::{validate_experiment_id, RunConfig};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::network::{FracNet, NetworkConfig};

/// Version of the record layout
pub const FORMAT_VERSION: u32 = 1;

const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";
const METADATA_KEY: &str = "fracnet";

/// Name of a checkpoint record within an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointName {
    /// Functions per IFS of the dataset the model was trained on
    pub num_functions: usize,
    /// Epoch after which the record was written
    pub epoch: usize,
}

impl CheckpointName {
    /// File name, `model_nf<nf>_<epoch>.<ext>`
    pub fn file_name(&self, extension: &str) -> String {
        format!("model_nf{}_{}.{}", self.num_functions, self.epoch, extension)
    }

    /// Inverse of [`CheckpointName::file_name`]
    pub fn parse(file_name: &str, extension: &str) -> Option<Self> {
        let stem = file_name
            .strip_suffix(extension)?
            .strip_suffix('.')?
            .strip_prefix("model_nf")?;
        let (nf, epoch) = stem.split_once('_')?;
        Some(Self {
            num_functions: nf.parse().ok()?,
            epoch: epoch.parse().ok()?,
        })
    }
}

/// Scalar part of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Record layout version
    pub format_version: u32,
    /// Experiment identifier
    pub experiment: String,
    /// Functions per IFS
    pub num_functions: usize,
    /// Epoch index
    pub epoch: usize,
    /// Learning rate at save time
    pub learning_rate: f64,
    /// Device tag at save time
    pub device: String,
    /// Architecture of the saved network
    pub network: NetworkConfig,
    /// Optimizer scalars
    pub optimizer: OptimizerHeader,
    /// Save timestamp
    pub saved_at: DateTime<Utc>,
}

/// Training state rebuilt from a record
pub struct RestoredState {
    /// Network with the stored parameters
    pub model: FracNet,
    /// Optimizer bound to `model` with the stored moments
    pub optimizer: Adam,
    /// Stored learning rate times the requested scale
    pub learning_rate: f64,
    /// Scalars of the record
    pub metadata: CheckpointMetadata,
}

/// Saves and restores checkpoint records of one experiment
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    experiment: String,
    num_functions: usize,
    extension: String,
}

impl CheckpointManager {
    /// Create a manager. The experiment identifier is mandatory and must be a
    /// single plain directory name.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        experiment: impl Into<String>,
        num_functions: usize,
        extension: impl Into<String>,
    ) -> Result<Self> {
        let experiment = experiment.into();
        validate_experiment_id(&experiment)?;
        Ok(Self {
            output_dir: output_dir.into(),
            experiment,
            num_functions,
            extension: extension.into(),
        })
    }

    /// Manager for the experiment described by a run configuration
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        Self::new(
            &config.checkpointing.output_dir,
            &config.experiment,
            config.data.num_functions,
            &config.checkpointing.extension,
        )
    }

    /// Directory holding the experiment's records
    pub fn experiment_dir(&self) -> PathBuf {
        self.output_dir.join(&self.experiment)
    }

    /// Experiment identifier
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Record name for an epoch of this experiment
    pub fn name(&self, epoch: usize) -> CheckpointName {
        CheckpointName {
            num_functions: self.num_functions,
            epoch,
        }
    }

    /// Path of a record
    pub fn path_for(&self, name: &CheckpointName) -> PathBuf {
        self.experiment_dir().join(name.file_name(&self.extension))
    }

    /// Write a record, replacing any record of the same name atomically
    #[instrument(skip(self, model, optimizer))]
    pub fn save(
        &self,
        name: &CheckpointName,
        model: &FracNet,
        learning_rate: f64,
        optimizer: &dyn Optimizer,
        device_tag: &str,
    ) -> Result<PathBuf> {
        let optimizer_state = optimizer.state_dict()?;

        let metadata = CheckpointMetadata {
            format_version: FORMAT_VERSION,
            experiment: self.experiment.clone(),
            num_functions: name.num_functions,
            epoch: name.epoch,
            learning_rate,
            device: device_tag.to_string(),
            network: model.config().clone(),
            optimizer: optimizer_state.header,
            saved_at: Utc::now(),
        };

        let mut tensors: Vec<(String, Tensor)> = model
            .state_dict()?
            .into_iter()
            .map(|(param, tensor)| (format!("{MODEL_PREFIX}{param}"), tensor))
            .collect();
        tensors.extend(
            optimizer_state
                .tensors
                .into_iter()
                .map(|(key, tensor)| (format!("{OPTIM_PREFIX}{key}"), tensor)),
        );

        let bytes = serialize_record(&tensors, &metadata)?;

        let path = self.path_for(name);
        fs::create_dir_all(self.experiment_dir())?;
        write_atomic(&path, &bytes)?;

        info!(
            "Saved checkpoint {} (epoch {}, lr {:.3e}, {} tensors)",
            path.display(),
            name.epoch,
            learning_rate,
            tensors.len()
        );
        Ok(path)
    }

    /// Rebuild model and optimizer from a record.
    ///
    /// `network` must describe an architecture whose parameters have the
    /// stored names and shapes. The returned learning rate is the stored one
    /// multiplied by `lr_scale` (1 when `None`) and is already applied to the
    /// optimizer. Nothing outside the returned value is modified.
    #[instrument(skip(self, device, network))]
    pub fn load(
        &self,
        name: &CheckpointName,
        device: &dyn ComputeDevice,
        network: &NetworkConfig,
        lr_scale: Option<f64>,
    ) -> Result<RestoredState> {
        let scale = lr_scale.unwrap_or(1.0);
        if !(scale.is_finite() && scale > 0.0) {
            return Err(Error::config(format!(
                "learning rate scale must be finite and > 0, got {scale}"
            )));
        }

        let path = self.path_for(name);
        if !path.is_file() {
            return Err(Error::checkpoint_not_found(path));
        }
        let bytes = fs::read(&path)?;

        let metadata = parse_metadata(&bytes)?;
        if !network.is_compatible_with(&metadata.network) {
            return Err(Error::config_mismatch(format!(
                "checkpoint {} was saved for {:?}, cannot load into {:?}",
                path.display(),
                metadata.network,
                network
            )));
        }

        let mut model_tensors = HashMap::new();
        let mut optim_tensors = BTreeMap::new();
        let records = SafeTensors::deserialize(&bytes)?;
        for (key, view) in records.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(Error::checkpoint(format!(
                    "tensor '{key}' has dtype {:?}, expected F32",
                    view.dtype()
                )));
            }
            let tensor = Tensor::from_raw_buffer(view.data(), DType::F32, view.shape(), device.device())?;
            if let Some(param) = key.strip_prefix(MODEL_PREFIX) {
                model_tensors.insert(param.to_string(), tensor);
            } else if let Some(slot) = key.strip_prefix(OPTIM_PREFIX) {
                optim_tensors.insert(slot.to_string(), tensor);
            } else {
                return Err(Error::checkpoint(format!("unexpected tensor '{key}'")));
            }
        }

        let model = FracNet::new(network.clone(), device.device())?;
        model.load_state_dict(&model_tensors)?;

        let optimizer_config = Adam::config_from_header(&metadata.optimizer)?;
        let mut optimizer = Adam::for_network(&model, optimizer_config)?;
        optimizer.load_state_dict(OptimizerStateDict {
            header: metadata.optimizer.clone(),
            tensors: optim_tensors,
        })?;

        let learning_rate = metadata.learning_rate * scale;
        optimizer.set_learning_rate(learning_rate);

        info!(
            "Restored {} (epoch {}, saved on {}), lr {:.3e} -> {:.3e}",
            path.display(),
            metadata.epoch,
            metadata.device,
            metadata.learning_rate,
            learning_rate
        );

        Ok(RestoredState {
            model,
            optimizer,
            learning_rate,
            metadata,
        })
    }

    /// Read only the scalars of a record
    pub fn read_metadata(&self, name: &CheckpointName) -> Result<CheckpointMetadata> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(Error::checkpoint_not_found(path));
        }
        parse_metadata(&fs::read(&path)?)
    }

    /// Records of this experiment and function count, sorted by epoch
    pub fn list(&self) -> Result<Vec<(CheckpointName, PathBuf)>> {
        let dir = self.experiment_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|f| CheckpointName::parse(f, &self.extension))
            else {
                continue;
            };
            if name.num_functions == self.num_functions && entry.file_type()?.is_file() {
                records.push((name, entry.path()));
            }
        }
        records.sort_by_key(|(name, _)| name.epoch);
        debug!("Found {} checkpoints in {}", records.len(), dir.display());
        Ok(records)
    }
}

fn serialize_record(tensors: &[(String, Tensor)], metadata: &CheckpointMetadata) -> Result<Vec<u8>> {
    let buffers = tensors
        .iter()
        .map(|(key, tensor)| {
            let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            Ok((key.as_str(), tensor.dims().to_vec(), bytes))
        })
        .collect::<Result<Vec<_>>>()?;

    let views = buffers
        .iter()
        .map(|(key, shape, bytes)| Ok((*key, TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;

    let header = HashMap::from([
        (METADATA_KEY.to_string(), serde_json::to_string(metadata)?),
        ("learning_rate".to_string(), metadata.learning_rate.to_string()),
        ("device".to_string(), metadata.device.clone()),
    ]);

    Ok(safetensors::serialize(
        views.iter().map(|(key, view)| (*key, view)),
        &Some(header),
    )?)
}

fn parse_metadata(bytes: &[u8]) -> Result<CheckpointMetadata> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let raw = header
        .metadata()
        .as_ref()
        .and_then(|map| map.get(METADATA_KEY))
        .ok_or_else(|| Error::checkpoint("record has no training metadata"))?;
    let metadata: CheckpointMetadata = serde_json::from_str(raw)?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(Error::checkpoint(format!(
            "unsupported record version {}, expected {FORMAT_VERSION}",
            metadata.format_version
        )));
    }
    Ok(metadata)
}

/// Write to a temporary sibling, sync, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| Error::internal(format!("invalid checkpoint path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        if tmp.is_file() {
            let _ = fs::remove_file(&tmp);
        }
        return result;
    }
    sync_parent(path)
}

/// Persist the directory entry of a renamed file
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}
