//! `resnet info`: configuration, progress and per-epoch metrics of a run.

use std::{fmt::Display, path::Path};

use resnet_training::{
    CheckpointPaths, CheckpointState, ResNetTrainingConfig, find_latest_checkpoint,
    checkpoint::{BEST_DIR, LAST_DIR},
    training::CONFIG_FILE,
};

/// Values read back from one `<split>/epoch-<n>/` directory.
#[derive(Debug, Default, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean of the logged batch losses.
    pub loss: Option<f64>,
    pub acc1: Option<f64>,
    pub acc5: Option<f64>,
    pub learning_rate: Option<f64>,
}

#[derive(Debug)]
pub struct ArtifactInfo {
    pub config: ResNetTrainingConfig,
    /// Newest complete per-epoch checkpoint.
    pub latest_checkpoint: Option<usize>,
    pub best: Option<CheckpointState>,
    pub last: Option<CheckpointState>,
    pub train_metrics: Vec<EpochMetrics>,
    pub valid_metrics: Vec<EpochMetrics>,
    pub test_metrics: Vec<EpochMetrics>,
}

impl ArtifactInfo {
    pub fn load(artifact_dir: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let root = Path::new(artifact_dir);
        let config = ResNetTrainingConfig::load(root.join(CONFIG_FILE))?;
        let named_state =
            |name| CheckpointState::load(&CheckpointPaths::named(root, name).state).ok();

        Ok(Self {
            config,
            latest_checkpoint: find_latest_checkpoint(root),
            best: named_state(BEST_DIR),
            last: named_state(LAST_DIR),
            train_metrics: split_metrics(&root.join("train")),
            valid_metrics: split_metrics(&root.join("valid")),
            test_metrics: split_metrics(&root.join("test")),
        })
    }

    /// Epochs with a checkpoint on disk.
    #[must_use]
    pub fn completed_epochs(&self) -> usize {
        self.latest_checkpoint.unwrap_or(0)
    }
}

fn split_metrics(split_dir: &Path) -> Vec<EpochMetrics> {
    let Ok(entries) = std::fs::read_dir(split_dir) else {
        return Vec::new();
    };

    let mut metrics: Vec<EpochMetrics> = entries
        .flatten()
        .filter_map(|entry| {
            let epoch = entry
                .file_name()
                .to_str()?
                .strip_prefix("epoch-")?
                .parse()
                .ok()?;
            Some(epoch_metrics(epoch, &entry.path()))
        })
        .collect();
    metrics.sort_by_key(|m| m.epoch);
    metrics
}

fn epoch_metrics(epoch: usize, dir: &Path) -> EpochMetrics {
    let values = |metric: &str| log_values(&dir.join(format!("{metric}.log")));
    let loss = values("Loss");

    EpochMetrics {
        epoch,
        loss: (!loss.is_empty()).then(|| loss.iter().sum::<f64>() / loss.len() as f64),
        acc1: values("Acc@1").last().copied(),
        acc5: values("Acc@5").last().copied(),
        learning_rate: values("LearningRate").last().copied(),
    }
}

/// First column of a `value,step` log, empty when the file is missing.
fn log_values(path: &Path) -> Vec<f64> {
    std::fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .filter_map(|line| line.split(',').next()?.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

const WIDTH: usize = 66;

/// A titled box of label/value rows.
struct Panel {
    title: String,
    rows: Vec<(String, String)>,
}

impl Panel {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            rows: Vec::new(),
        }
    }

    fn row(mut self, label: &str, value: impl Display) -> Self {
        self.rows.push((label.to_string(), value.to_string()));
        self
    }

    fn row_if(self, label: &str, value: Option<impl Display>) -> Self {
        match value {
            Some(value) => self.row(label, value),
            None => self,
        }
    }

    fn print(&self) {
        let fill = WIDTH.saturating_sub(5 + self.title.chars().count());
        println!("╭─ {} {}╮", self.title, "─".repeat(fill));
        for (label, value) in &self.rows {
            let line = format!(" {label:<15} {value}");
            let pad = (WIDTH - 2).saturating_sub(line.chars().count());
            println!("│{line}{}│", " ".repeat(pad));
        }
        println!("╰{}╯", "─".repeat(WIDTH - 2));
        println!();
    }
}

fn bar(done: usize, total: usize, cells: usize) -> String {
    let ratio = if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    };
    let full = (ratio * cells as f64) as usize;
    format!(
        "[{}{}] {:.0}%",
        "█".repeat(full),
        "░".repeat(cells - full),
        ratio * 100.0
    )
}

fn cell(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".into(), |v| format!("{v:.precision$}"))
}

fn print_table(title: &str, metrics: &[EpochMetrics]) {
    println!("{title}");
    println!(
        "  {:>5}  {:>10}  {:>8}  {:>8}  {:>10}",
        "epoch", "loss", "acc@1", "acc@5", "lr"
    );
    for m in metrics {
        println!(
            "  {:>5}  {:>10}  {:>8}  {:>8}  {:>10}",
            m.epoch,
            cell(m.loss, 4),
            cell(m.acc1, 2),
            cell(m.acc5, 2),
            m.learning_rate
                .map_or_else(|| "-".into(), |v| format!("{v:.2e}"))
        );
    }
    println!();
}

fn latest_panel(title: &str, metrics: &[EpochMetrics]) {
    if let Some(m) = metrics.last() {
        Panel::new(format!("{title}, epoch {}", m.epoch))
            .row_if("Loss:", m.loss.map(|v| format!("{v:.4}")))
            .row_if("Acc@1:", m.acc1.map(|v| format!("{v:.2}%")))
            .row_if("Acc@5:", m.acc5.map(|v| format!("{v:.2}%")))
            .print();
    }
}

pub fn print_info(info: &ArtifactInfo, verbose: bool) {
    let params = &info.config.params;
    let (model, train, data) = (&params.model, &params.train, &params.data);

    Panel::new("Model")
        .row("Architecture:", model.arch)
        .row("Classes:", model.num_classes)
        .row("Blocks:", format!("{:?} {:?}", model.arch.block(), model.arch.layers()))
        .row_if(
            "Groups:",
            (model.groups > 1 || model.width_per_group != 64)
                .then(|| format!("{} x {}", model.groups, model.width_per_group)),
        )
        .row("Precision:", params.dtype)
        .print();

    Panel::new("Optimization")
        .row("Batch:", train.batch)
        .row("Epochs:", train.epochs)
        .row("SGD:", format!("lr {:.2e}, momentum {}", train.lr, train.momentum))
        .row("Weight decay:", format!("{:.1e}", train.weight_decay))
        .row("Smoothing:", train.label_smoothing)
        .row("EMA decay:", train.ema_decay)
        .row(
            "Restarts:",
            format!("every {} epochs, x{}", train.restart_period(), train.lr_t_mult),
        )
        .row("Loss scaling:", params.loss_scaling())
        .row("Crop:", format!("{} (eval resize {})", data.image_size, data.resize_size))
        .print();

    Panel::new("Progress")
        .row("Progress:", bar(info.completed_epochs(), train.epochs, 30))
        .row("Epochs:", format!("{} / {}", info.completed_epochs(), train.epochs))
        .row_if(
            "Best:",
            info.best
                .as_ref()
                .map(|s| format!("epoch {} (Acc@1 {:.2}%)", s.epoch, s.best_acc1)),
        )
        .row("Finished:", if info.last.is_some() { "yes" } else { "no" })
        .print();

    latest_panel("Train", &info.train_metrics);
    latest_panel("Valid", &info.valid_metrics);
    latest_panel("Test", &info.test_metrics);

    if verbose {
        for (title, metrics) in [
            ("Train by epoch", &info.train_metrics),
            ("Valid by epoch", &info.valid_metrics),
        ] {
            if !metrics.is_empty() {
                print_table(title, metrics);
            }
        }
    }
}
