use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fracnet::config::Split;
use fracnet::data::{generate_fractals, GeneratorConfig};
use fracnet::{
    select_device, CheckpointManager, ComputeDevice, DataLoader, DataLoaderConfig, Dataset,
    FractalDataset, Orchestrator, RunConfig, RunSummary,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "fracnet")]
#[command(about = "Train multi-branch CNNs on IFS fractal datasets", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train for the configured number of epochs, then resume if configured
    Train {
        /// Configuration file (JSON or YAML); built-in defaults when omitted
        #[arg(short, long, env = "FRACNET_CONFIG")]
        config: Option<PathBuf>,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,
    },

    /// Restore a stored epoch and optionally keep training
    Resume {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, env = "FRACNET_CONFIG")]
        config: Option<PathBuf>,

        /// Epoch whose checkpoint is restored
        #[arg(long)]
        epoch: usize,

        /// Multiplier applied to the stored learning rate
        #[arg(long, default_value_t = 1.0)]
        lr_scale: f64,

        /// Epochs to train after restoring
        #[arg(long, default_value_t = 0)]
        epochs: usize,
    },

    /// Generate random IFS fractals into a split of the data root
    Generate {
        /// Configuration file (JSON or YAML); selects data root and nf
        #[arg(short, long, env = "FRACNET_CONFIG")]
        config: Option<PathBuf>,

        /// Split to append to (train, valid, test)
        #[arg(long, default_value = "train")]
        split: Split,

        /// Number of fractals to generate
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,

        /// Chaos game points per fractal
        #[arg(long, default_value_t = 10_000)]
        points: usize,

        /// Side length of the square images in pixels
        #[arg(long, default_value_t = 640)]
        size: u32,

        /// Base random seed; defaults to the training seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// List checkpoint records of the configured experiment
    Checkpoints {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, env = "FRACNET_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Train { config, epochs } => train(config.as_deref(), epochs),
        Commands::Resume {
            config,
            epoch,
            lr_scale,
            epochs,
        } => resume(config.as_deref(), epoch, lr_scale, epochs),
        Commands::Generate {
            config,
            split,
            count,
            points,
            size,
            seed,
        } => generate(config.as_deref(), split, count, points, size, seed),
        Commands::Checkpoints { config } => list_checkpoints(config.as_deref()),
        Commands::Config { file } => validate_config(&file),
        Commands::Info => {
            show_system_info();
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8, json_output: bool) {
    let default_level = match verbosity {
        0 => "fracnet=info,warn",
        1 => "fracnet=debug,info",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_target(false).with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display())),
        None => {
            info!("No configuration file given, using the reference configuration");
            Ok(RunConfig::default())
        }
    }
}

/// Datasets and loaders of one run
struct Loaders {
    train_set: Arc<dyn Dataset>,
    train: DataLoader,
    valid: DataLoader,
    test: Option<DataLoader>,
}

fn open_split(config: &RunConfig, split: Split) -> Result<Arc<dyn Dataset>> {
    let dataset = FractalDataset::from_split(&config.data, split).with_context(|| {
        format!(
            "Failed to open {} split at {}",
            split.dir_name(),
            config.data.split_dir(split).display()
        )
    })?;
    Ok(Arc::new(dataset))
}

fn build_loaders(config: &RunConfig) -> Result<Loaders> {
    let train_set = open_split(config, Split::Train)?;
    let valid_set = open_split(config, Split::Valid)?;
    let test_set = if config.data.descriptor_path(Split::Test).is_file() {
        Some(open_split(config, Split::Test)?)
    } else {
        warn!("No test split found, skipping the final test evaluation");
        None
    };

    let train = DataLoader::new(
        train_set.clone(),
        DataLoaderConfig::training(&config.data, config.training.seed),
    )?;
    let valid = DataLoader::new(valid_set, DataLoaderConfig::evaluation(&config.data))?;
    let test = test_set
        .map(|set| DataLoader::new(set, DataLoaderConfig::evaluation(&config.data)))
        .transpose()?;

    let splits = [
        ("train", Some(&train)),
        ("valid", Some(&valid)),
        ("test", test.as_ref()),
    ];
    for (split, loader) in splits {
        if let Some(loader) = loader {
            info!(
                "{} split: {} samples, {} batches of up to {}",
                split,
                loader.dataset_size(),
                loader.num_batches(),
                loader.batch_size()
            );
        }
    }

    Ok(Loaders {
        train_set,
        train,
        valid,
        test,
    })
}

fn report(summary: &RunSummary) {
    for epoch in &summary.epochs {
        info!(
            "epoch {:>3}  train {:.6}  valid {:.6}  mae {:.6}  -> {}",
            epoch.epoch,
            epoch.train.loss,
            epoch.validation.loss,
            epoch.validation.mean_abs_error,
            epoch.checkpoint.display()
        );
    }
    if let Some(test) = &summary.test {
        info!(
            "test loss {:.6}, mae {:.6}, accuracy {:.2}%",
            test.loss,
            test.mean_abs_error,
            test.accuracy * 100.0
        );
    }
}

fn train(config_path: Option<&Path>, epochs: Option<usize>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(epochs) = epochs {
        config.training.num_epochs = epochs;
    }
    config.validate().context("Invalid configuration")?;

    let device = select_device(&config.device).context("Failed to select compute device")?;
    let mut loaders = build_loaders(&config)?;

    let num_epochs = config.training.num_epochs;
    let resume = config.resume.clone();
    let mut orchestrator =
        Orchestrator::from_dataset(config, loaders.train_set.as_ref(), Box::new(device))
            .context("Failed to initialize training")?;

    let summary = orchestrator
        .run(
            num_epochs,
            &mut loaders.train,
            &mut loaders.valid,
            loaders.test.as_mut(),
        )
        .context("Training failed")?;
    report(&summary);

    if let Some(resume) = resume {
        orchestrator
            .resume(resume.from_epoch, resume.lr_scale)
            .with_context(|| format!("Failed to resume from epoch {}", resume.from_epoch))?;
        if resume.additional_epochs > 0 {
            let summary = orchestrator
                .run(
                    resume.additional_epochs,
                    &mut loaders.train,
                    &mut loaders.valid,
                    loaders.test.as_mut(),
                )
                .context("Resumed training failed")?;
            report(&summary);
        }
    }

    info!("Training complete!");
    Ok(())
}

fn resume(config_path: Option<&Path>, epoch: usize, lr_scale: f64, epochs: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let device = select_device(&config.device).context("Failed to select compute device")?;
    let mut loaders = build_loaders(&config)?;

    let mut orchestrator =
        Orchestrator::from_dataset(config, loaders.train_set.as_ref(), Box::new(device))
            .context("Failed to initialize training")?;
    let lr = orchestrator
        .resume(epoch, lr_scale)
        .with_context(|| format!("Failed to resume from epoch {epoch}"))?;
    info!("Restored epoch {} with learning rate {:.3e}", epoch, lr);

    if epochs > 0 {
        let summary = orchestrator
            .run(
                epochs,
                &mut loaders.train,
                &mut loaders.valid,
                loaders.test.as_mut(),
            )
            .context("Resumed training failed")?;
        report(&summary);
    }
    Ok(())
}

fn generate(
    config_path: Option<&Path>,
    split: Split,
    count: usize,
    points: usize,
    size: u32,
    seed: Option<u64>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let generator = GeneratorConfig {
        num_fractals: count,
        num_functions: config.data.num_functions,
        num_points: points,
        width: size,
        height: size,
        seed: seed.unwrap_or(config.training.seed),
        ..Default::default()
    };

    let descriptor = config.data.descriptor_path(split);
    let report = generate_fractals(&descriptor, &generator)
        .with_context(|| format!("Failed to generate fractals into {}", descriptor.display()))?;
    info!(
        "Wrote fractals {}..{} to {}",
        report.first_index,
        report.first_index + report.count,
        report.descriptor.display()
    );
    Ok(())
}

fn list_checkpoints(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = CheckpointManager::from_config(&config)?;
    let records = manager.list().context("Failed to list checkpoints")?;

    if records.is_empty() {
        println!("No checkpoints in {}", manager.experiment_dir().display());
        return Ok(());
    }

    println!("Checkpoints of '{}':", manager.experiment());
    for (name, path) in records {
        match manager.read_metadata(&name) {
            Ok(meta) => println!(
                "  epoch {:>4}  lr {:.3e}  device {:<8}  saved {}  {}",
                name.epoch,
                meta.learning_rate,
                meta.device,
                meta.saved_at.format("%Y-%m-%d %H:%M:%S"),
                path.display()
            ),
            Err(e) => println!("  epoch {:>4}  unreadable ({e})  {}", name.epoch, path.display()),
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = RunConfig::from_file(config_path).context("Failed to load configuration file")?;

    // RunConfig::from_file already validates
    info!("Configuration is valid");
    info!("Configuration summary:");
    info!("  - Experiment: {}", config.experiment);
    info!(
        "  - Data: {} (nf{}), batch size {}, {} workers",
        config.data.root.display(),
        config.data.num_functions,
        config.data.batch_size,
        config.data.num_workers
    );
    info!(
        "  - Model: {} branches, dropout {}",
        config.model.branches.len(),
        config.model.dropout
    );
    info!(
        "  - Optimizer: lr {:.3e}, betas ({}, {}), weight decay {}",
        config.optimizer.learning_rate,
        config.optimizer.beta1,
        config.optimizer.beta2,
        config.optimizer.weight_decay
    );
    info!(
        "  - Training: {} epochs, {:?} loss",
        config.training.num_epochs, config.training.loss
    );
    if let Some(resume) = &config.resume {
        info!(
            "  - Resume: epoch {} x{} lr, {} more epochs",
            resume.from_epoch, resume.lr_scale, resume.additional_epochs
        );
    }

    Ok(())
}

fn show_system_info() {
    println!("FracNet - multi-branch CNN training on IFS fractals");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Accelerate support (not compiled)");

    println!("  [x] CPU");

    match select_device(&Default::default()) {
        Ok(device) => println!("\nDefault device: {}", device.tag()),
        Err(e) => println!("\nDefault device: unavailable ({e})"),
    }
    println!();
    println!("Usage:");
    println!("  fracnet generate -c run.yaml --split train -n 1000");
    println!("  fracnet train -c run.yaml              # Train and checkpoint every epoch");
    println!("  fracnet resume -c run.yaml --epoch 8 --lr-scale 0.1 --epochs 4");
    println!("  fracnet checkpoints -c run.yaml        # List stored records");
    println!("  fracnet config -f run.yaml             # Validate configuration");
}
