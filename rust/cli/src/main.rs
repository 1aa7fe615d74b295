use std::{
    error::Error,
    path::{Path, PathBuf},
};

use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use resnet_cli::{artifact_info, metrics_export};
use resnet_config::{DType, TrainConfig, TrainParams};
use resnet_core::{ComputeBackend, TrainingBackend};
use resnet_training::{
    CheckpointSelector, ResNetClassifier, ResNetTrainingConfig, evaluate, find_latest_checkpoint,
    train,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "resnet", about = "ResNet image classifier training and inference")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on an image folder dataset
    Train(TrainArgs),
    /// Evaluate the averaged weights of a run on a labelled image folder
    Eval {
        /// Artifact directory containing the trained model
        artifact_dir: PathBuf,
        /// Image folder to evaluate on (default: the run's validation directory)
        #[arg(long)]
        data: Option<PathBuf>,
        /// Checkpoint to evaluate: best, last or an epoch number
        #[arg(long, default_value = "best")]
        checkpoint: String,
        /// Batch size for evaluation
        #[arg(long, default_value = "128")]
        batch: usize,
        /// Data loading workers
        #[arg(long, default_value = "4")]
        workers: usize,
    },
    /// Classify a single image
    Infer {
        /// Artifact directory containing the trained model
        artifact_dir: PathBuf,
        /// Image to classify
        image: PathBuf,
        /// Number of classes to report
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Checkpoint to load: best, last or an epoch number
        #[arg(long, default_value = "best")]
        checkpoint: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
    /// Show information about a training run
    Info {
        /// Artifact directory to inspect
        artifact_dir: String,
        /// Show detailed metrics for each epoch
        #[arg(long, short)]
        verbose: bool,
    },
    /// Export training metrics to CSV for plotting
    ExportMetrics {
        /// Artifact directories (supports glob patterns like "./runs/*")
        #[arg(required = true)]
        dirs: Vec<String>,

        /// Output CSV base path (creates {name}_train.csv, {name}_valid.csv and {name}_test.csv)
        #[arg(short, long, default_value = "metrics.csv")]
        output: String,

        /// Comma-separated metrics: loss, acc1, acc5, learning-rate, loss-scale
        #[arg(short, long, value_delimiter = ',', default_value = "loss,acc1,acc5")]
        metrics: Vec<metrics_export::MetricType>,

        /// Include training metrics
        #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
        train: bool,

        /// Include validation metrics
        #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
        valid: bool,

        /// Include test metrics written by `resnet eval`
        #[arg(long, default_value = "false", action = clap::ArgAction::Set)]
        test: bool,

        /// Downsample to N points per series (bucket averaging)
        #[arg(long)]
        target_points: Option<usize>,

        /// Centered moving average window
        #[arg(long)]
        window: Option<usize>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Training parameters (architecture, batch, lr, data, etc.)
    #[command(flatten)]
    params: TrainParams,

    /// Experiment file (TOML). Flags that differ from their defaults override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "./artifacts")]
    out: String,

    /// Continue the run stored in this artifact directory from its newest checkpoint
    #[arg(long)]
    resume: Option<String>,
}

impl TrainArgs {
    /// Resolve the run configuration. `None` means there is nothing left to train.
    fn into_config(self) -> Result<Option<ResNetTrainingConfig>, Box<dyn Error>> {
        let Some(resume_dir) = self.resume else {
            let params = match &self.config {
                Some(path) => TrainParams::from_toml_file(path)?.overlay(&self.params)?,
                None => self.params,
            };
            return Ok(Some(ResNetTrainingConfig::new(params, self.out)));
        };

        let config_path = Path::new(&resume_dir).join(resnet_training::training::CONFIG_FILE);
        let mut config = ResNetTrainingConfig::load(&config_path)
            .map_err(|e| format!("failed to load config from {}: {e}", config_path.display()))?;

        // only flags that differ from their defaults touch the saved run
        if self.params.train.epochs != TrainConfig::default().epochs {
            config.params.train.epochs = self.params.train.epochs;
        }
        if self.params.dry_run {
            config.params.dry_run = true;
        }

        let resume_epoch = find_latest_checkpoint(Path::new(&resume_dir))
            .ok_or_else(|| format!("no checkpoint found in {resume_dir}/checkpoint/"))?;

        if resume_epoch >= config.params.train.epochs {
            tracing::info!(
                "Checkpoint {resume_epoch} already covers all {} epochs, nothing to train.",
                config.params.train.epochs
            );
            tracing::info!("To continue training, pass --epochs with a higher value.");
            return Ok(None);
        }

        config.resume_epoch = Some(resume_epoch);
        tracing::info!("Resuming training from epoch {resume_epoch}");
        Ok(Some(config))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Train(args) => {
            let Some(config) = args.into_config()? else {
                return Ok(());
            };
            let params = &config.params;

            tracing::info!("Training ResNet classifier...");
            tracing::info!("Artifacts will be saved to: {}", config.artifact_dir);
            tracing::info!(
                "Model: {} with {} classes",
                params.model.arch,
                params.model.num_classes
            );
            tracing::info!(
                "batch {}, {} epochs, lr {}",
                params.train.batch,
                params.train.epochs,
                params.train.lr
            );
            tracing::info!("Train data: {}", params.data.train_dir);
            tracing::info!("Valid data: {}", params.data.valid_dir);

            let device = Default::default();
            match params.dtype {
                DType::F32 => {
                    tracing::info!("Using float32");
                    train_on::<TrainingBackend<f32>>(&config, &device)
                }
                #[cfg(any(feature = "cuda", feature = "rocm", feature = "wgpu", feature = "cpu"))]
                DType::F16 => {
                    tracing::info!("Using float16");
                    train_on::<TrainingBackend<resnet_core::f16>>(&config, &device)
                }
                #[cfg(any(feature = "cuda", feature = "rocm", feature = "wgpu", feature = "cpu"))]
                DType::BF16 => {
                    tracing::info!("Using bfloat16");
                    train_on::<TrainingBackend<resnet_core::bf16>>(&config, &device)
                }
                #[cfg(not(any(
                    feature = "cuda",
                    feature = "rocm",
                    feature = "wgpu",
                    feature = "cpu"
                )))]
                dtype @ (DType::F16 | DType::BF16) => Err(format!(
                    "{dtype} needs a cuda, rocm, wgpu or cpu build, this one only has ndarray"
                )
                .into()),
            }
        }
        Commands::Eval {
            artifact_dir,
            data,
            checkpoint,
            batch,
            workers,
        } => {
            let checkpoint: CheckpointSelector = checkpoint.parse()?;
            let device = Default::default();
            let result = evaluate::<ComputeBackend>(
                &device,
                &artifact_dir,
                data.as_deref(),
                checkpoint,
                batch,
                workers,
            )?;

            println!();
            println!("=== Evaluation Results ===");
            println!("  Checkpoint:        {checkpoint}");
            println!("  Samples evaluated: {}", result.num_samples);
            println!("  Acc@1:             {:.3}", result.acc1);
            println!("  Acc@5:             {:.3}", result.acc5);
            Ok(())
        }
        Commands::Infer {
            artifact_dir,
            image,
            top_k,
            checkpoint,
        } => {
            let checkpoint: CheckpointSelector = checkpoint.parse()?;
            let device = Default::default();
            infer::<ComputeBackend>(&artifact_dir, &image, top_k, checkpoint, device)
        }
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "resnet", &mut std::io::stdout());
            Ok(())
        }
        Commands::Info {
            artifact_dir,
            verbose,
        } => {
            let info = artifact_info::ArtifactInfo::load(&artifact_dir)
                .map_err(|e| format!("failed to load artifact info from {artifact_dir}: {e}"))?;
            artifact_info::print_info(&info, verbose);
            Ok(())
        }
        Commands::ExportMetrics {
            dirs,
            output,
            metrics,
            train,
            valid,
            test,
            target_points,
            window,
        } => {
            let config = metrics_export::ExportConfig {
                metrics,
                include_train: train,
                include_valid: valid,
                include_test: test,
                target_points,
                window,
            };
            metrics_export::export_metrics(dirs, &output, config)
        }
    }
}

fn train_on<B: AutodiffBackend>(
    config: &ResNetTrainingConfig,
    device: &B::Device,
) -> Result<(), Box<dyn Error>> {
    if let Some(seed) = config.params.seed {
        tracing::info!("Using fixed RNG seed: {seed}");
        B::seed(device, seed);
    }

    let summary = train::<B>(device, config)?;
    if let Some(acc1) = summary.last_acc1 {
        tracing::info!(
            "Final Acc@1 {acc1:.3}, best Acc@1 {:.3} over {} epochs",
            summary.best_acc1,
            summary.epochs_completed
        );
    }
    Ok(())
}

fn infer<B: Backend>(
    artifact_dir: &Path,
    image: &Path,
    top_k: usize,
    checkpoint: CheckpointSelector,
    device: B::Device,
) -> Result<(), Box<dyn Error>> {
    let classifier = ResNetClassifier::<B>::load_from_artifacts(artifact_dir, checkpoint, device)?;
    let predictions = classifier.classify(image, top_k)?;

    println!("{}", image.display());
    for (rank, p) in predictions.iter().enumerate() {
        println!(
            "  {:>2}. {:>6.2}%  {}",
            rank + 1,
            p.probability * 100.0,
            p.class
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use resnet_config::Arch;

    use super::*;

    fn train_args(args: &[&str]) -> TrainArgs {
        let mut argv = vec!["resnet", "train"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Train(args) => args,
            _ => unreachable!(),
        }
    }

    fn fake_run(dir: &Path, epochs: usize, completed: usize) {
        let mut params = TrainParams::default();
        params.train.epochs = epochs;
        ResNetTrainingConfig::new(params, dir.display().to_string())
            .save(dir.join("config.json"))
            .unwrap();

        let checkpoint_dir = dir.join("checkpoint");
        std::fs::create_dir_all(&checkpoint_dir).unwrap();
        for e in 1..=completed {
            for kind in ["model", "ema", "optim"] {
                std::fs::write(checkpoint_dir.join(format!("{kind}-{e}.mpk")), b"fake").unwrap();
            }
            std::fs::write(checkpoint_dir.join(format!("state-{e}.json")), b"{}").unwrap();
        }
    }

    #[test]
    fn test_train_flags() {
        let args = train_args(&["--arch", "resnet50", "--num-classes", "10", "--out", "runs/a"]);
        let config = args.into_config().unwrap().unwrap();
        assert_eq!(config.params.model.arch, Arch::Resnet50);
        assert_eq!(config.params.model.num_classes, 10);
        assert_eq!(config.artifact_dir, "runs/a");
        assert_eq!(config.resume_epoch, None);
    }

    #[test]
    fn test_experiment_file_with_flag_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.toml");
        std::fs::write(&path, "arch = \"resnet34\"\nepochs = 90\nbatch = 64\n").unwrap();

        let args = train_args(&["--config", path.to_str().unwrap(), "--batch", "32"]);
        let params = args.into_config().unwrap().unwrap().params;
        assert_eq!(params.model.arch, Arch::Resnet34);
        assert_eq!(params.train.epochs, 90);
        assert_eq!(params.train.batch, 32);
    }

    #[test]
    fn test_resume_picks_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        fake_run(dir.path(), 5, 2);

        let args = train_args(&["--resume", dir.path().to_str().unwrap()]);
        let config = args.into_config().unwrap().unwrap();
        assert_eq!(config.resume_epoch, Some(2));
        assert_eq!(config.params.train.epochs, 5);
    }

    #[test]
    fn test_resume_finished_run_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        fake_run(dir.path(), 2, 2);

        let args = train_args(&["--resume", dir.path().to_str().unwrap()]);
        assert!(args.into_config().unwrap().is_none());

        // more epochs reopen it
        let args = train_args(&["--resume", dir.path().to_str().unwrap(), "--epochs", "4"]);
        let config = args.into_config().unwrap().unwrap();
        assert_eq!(config.params.train.epochs, 4);
        assert_eq!(config.resume_epoch, Some(2));
    }

    #[test]
    fn test_resume_without_checkpoint_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fake_run(dir.path(), 5, 0);

        let args = train_args(&["--resume", dir.path().to_str().unwrap()]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_unknown_checkpoint_is_rejected() {
        let result = run(Commands::Infer {
            artifact_dir: PathBuf::from("runs/a"),
            image: PathBuf::from("x.png"),
            top_k: 5,
            checkpoint: "newest".into(),
        });
        assert!(result.unwrap_err().to_string().contains("newest"));
    }
}
