//! Configuration structures for a FracNet training run
//!
//! A run is described by one immutable [`RunConfig`] read at startup. The
//! [`Default`] implementation is the reference configuration used to train the
//! two-function fractal models.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::network::BranchConfig;
use crate::training::loss::LossType;

/// Complete configuration of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Experiment identifier, part of every checkpoint name
    pub experiment: String,
    /// Dataset location and batching
    pub data: DataConfig,
    /// Network hyperparameters
    pub model: ModelConfig,
    /// Optimizer hyperparameters
    pub optimizer: OptimizerConfig,
    /// Epoch loop settings
    pub training: TrainingParams,
    /// Checkpoint storage
    pub checkpointing: CheckpointingConfig,
    /// Compute device selection
    pub device: DeviceConfig,
    /// Optional resumption from a stored epoch
    #[serde(default)]
    pub resume: Option<ResumeConfig>,
}

impl RunConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_experiment_id(&self.experiment)?;
        self.data.validate()?;
        self.model.validate()?;
        self.optimizer.validate()?;

        if self.training.num_epochs == 0 {
            return Err(Error::config("num_epochs must be > 0"));
        }
        if self.training.log_every == 0 {
            return Err(Error::config("log_every must be > 0"));
        }
        if self.checkpointing.extension.is_empty() || self.checkpointing.extension.contains('.') {
            return Err(Error::config(
                "Checkpoint extension must be non-empty and must not contain '.'",
            ));
        }

        if let Some(resume) = &self.resume {
            if !(resume.lr_scale.is_finite() && resume.lr_scale > 0.0) {
                return Err(Error::config(format!(
                    "Resume lr_scale must be finite and > 0, got {}",
                    resume.lr_scale
                )));
            }
        }

        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            experiment: "fracnet".to_string(),
            data: DataConfig::default(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: TrainingParams::default(),
            checkpointing: CheckpointingConfig::default(),
            device: DeviceConfig::default(),
            resume: None,
        }
    }
}

/// Check that an experiment identifier names exactly one directory below the
/// checkpoint output directory
pub fn validate_experiment_id(experiment: &str) -> Result<()> {
    if experiment.trim().is_empty() {
        return Err(Error::config("Experiment identifier must not be empty"));
    }
    if experiment == "." || experiment == ".." {
        return Err(Error::config(format!(
            "Experiment identifier '{experiment}' is not a directory name"
        )));
    }
    if experiment
        .chars()
        .any(|c| std::path::is_separator(c) || c.is_whitespace())
    {
        return Err(Error::config(format!(
            "Experiment identifier '{experiment}' must not contain path separators or whitespace"
        )));
    }
    Ok(())
}

/// Dataset splits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training samples
    Train,
    /// Validation samples, evaluated after every epoch
    Valid,
    /// Test samples, evaluated once after training
    Test,
}

impl Split {
    /// Directory name of the split under the data root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

impl std::str::FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "valid" | "validation" => Ok(Split::Valid),
            "test" => Ok(Split::Test),
            other => Err(format!("unknown split '{other}', expected train, valid or test")),
        }
    }
}

/// Dataset and batch loading configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the `train/`, `valid/` and `test/` splits
    pub root: PathBuf,
    /// Number of functions per IFS, selects the `nf<N>` subdirectory
    pub num_functions: usize,
    /// Descriptor file name inside each split directory
    pub descriptor_file: String,
    /// Samples per batch
    pub batch_size: usize,
    /// Worker threads used to fetch samples (0 loads inline)
    pub num_workers: usize,
    /// Reshuffle the training set every epoch
    pub shuffle_train: bool,
    /// Drop the final incomplete batch
    pub drop_last: bool,
}

impl DataConfig {
    /// Directory of a split, e.g. `<root>/train/nf2`
    pub fn split_dir(&self, split: Split) -> PathBuf {
        self.root
            .join(split.dir_name())
            .join(format!("nf{}", self.num_functions))
    }

    /// Descriptor path of a split, e.g. `<root>/train/nf2/fracdata.dat`
    pub fn descriptor_path(&self, split: Split) -> PathBuf {
        self.split_dir(split).join(&self.descriptor_file)
    }

    fn validate(&self) -> Result<()> {
        if self.num_functions == 0 {
            return Err(Error::config("num_functions must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.descriptor_file.is_empty() {
            return Err(Error::config("descriptor_file must not be empty"));
        }
        Ok(())
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            num_functions: 2,
            descriptor_file: "fracdata.dat".to_string(),
            batch_size: 32,
            num_workers: 6.min(num_cpus::get()),
            shuffle_train: true,
            drop_last: false,
        }
    }
}

/// Network hyperparameters that do not depend on the data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Dropout rate applied to the concatenated branch features
    pub dropout: f32,
    /// Parallel convolutional branches, in order
    pub branches: Vec<BranchConfig>,
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.branches.is_empty() {
            return Err(Error::config("At least one branch is required"));
        }
        for (i, branch) in self.branches.iter().enumerate() {
            branch.validate(i)?;
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        let widths = [3, 5, 7, 11, 25, 19, 15];
        let pools = [10, 10, 8, 8, 4, 4, 3];
        Self {
            dropout: 0.0,
            branches: widths
                .iter()
                .zip(pools.iter())
                .map(|(&width, &pool_size)| BranchConfig {
                    width,
                    kernel_size: 3,
                    pool_size,
                })
                .collect(),
        }
    }
}

/// Optimizer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// First moment decay
    pub beta1: f64,
    /// Second moment decay
    pub beta2: f64,
    /// Denominator epsilon
    pub epsilon: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
    /// Apply weight decay to the parameters directly (AdamW) instead of
    /// adding it to the gradient
    #[serde(default)]
    pub decoupled_weight_decay: bool,
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config("learning_rate must be finite and > 0"));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(Error::config(format!("{name} must be in [0, 1), got {beta}")));
            }
        }
        if self.epsilon <= 0.0 {
            return Err(Error::config("epsilon must be > 0"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be >= 0"));
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            decoupled_weight_decay: false,
        }
    }
}

/// Epoch loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Number of epochs
    pub num_epochs: usize,
    /// Loss used for both training and evaluation
    pub loss: LossType,
    /// Emit a running-loss debug line every N steps
    pub log_every: usize,
    /// Seed for shuffling
    pub seed: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 2,
            loss: LossType::Mse,
            log_every: 50,
            seed: 42,
        }
    }
}

/// Checkpoint storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointingConfig {
    /// Directory under which `<experiment>/` folders are created
    pub output_dir: PathBuf,
    /// File extension of checkpoint records
    pub extension: String,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("checkpoints"),
            extension: "safetensors".to_string(),
        }
    }
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Requested device type
    pub device_type: DeviceType,
    /// Accelerator ordinal
    pub ordinal: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Auto,
            ordinal: 0,
        }
    }
}

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Best available accelerator, else CPU
    Auto,
    /// CPU device
    Cpu,
    /// CUDA GPU, falls back to CPU when unavailable
    Cuda,
    /// Metal (Apple Silicon), falls back to CPU when unavailable
    Metal,
}

/// Resumption from a stored epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Epoch whose checkpoint is restored
    pub from_epoch: usize,
    /// Multiplier applied to the stored learning rate
    pub lr_scale: f64,
    /// Epochs trained after restoring (0 only restores)
    #[serde(default)]
    pub additional_epochs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_reference_run() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.branches.len(), 7);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.optimizer.learning_rate, 1e-5);
        assert_eq!(config.optimizer.weight_decay, 0.01);
        assert_eq!(config.training.num_epochs, 2);

        let pools: Vec<usize> = config.model.branches.iter().map(|b| b.pool_size).collect();
        assert_eq!(pools, vec![10, 10, 8, 8, 4, 4, 3]);
    }

    #[test]
    fn test_split_paths() {
        let config = DataConfig {
            root: PathBuf::from("/data"),
            ..Default::default()
        };
        assert_eq!(config.split_dir(Split::Valid), PathBuf::from("/data/valid/nf2"));
        assert_eq!(
            config.descriptor_path(Split::Test),
            PathBuf::from("/data/test/nf2/fracdata.dat")
        );
    }

    #[test]
    fn test_split_from_str() {
        assert_eq!("train".parse::<Split>(), Ok(Split::Train));
        assert_eq!("Validation".parse::<Split>(), Ok(Split::Valid));
        assert_eq!("test".parse::<Split>(), Ok(Split::Test));
        assert!("holdout".parse::<Split>().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RunConfig::default();
        config.experiment = "two words".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.experiment = "..".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RunConfig::default();
        config.model.dropout = 1.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RunConfig::default();
        config.model.branches.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RunConfig::default();
        config.resume = Some(ResumeConfig {
            from_epoch: 8,
            lr_scale: 0.0,
            additional_epochs: 0,
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_json_and_yaml_files() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::default();

        let json_path = dir.path().join("run.json");
        config.to_file(&json_path).unwrap();
        assert_eq!(RunConfig::from_file(&json_path).unwrap(), config);

        let yaml_path = dir.path().join("run.yaml");
        std::fs::write(&yaml_path, serde_yaml::to_string(&config).unwrap()).unwrap();
        assert_eq!(RunConfig::from_file(&yaml_path).unwrap(), config);
    }
}
