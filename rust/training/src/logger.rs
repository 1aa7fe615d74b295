use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

/// Scalar metric files under `<artifact_dir>/<split>/epoch-<n>/<Metric>.log`.
///
/// Each line is `value,step`. Epoch directories are 1-based.
#[derive(Clone, Debug)]
pub struct MetricLogger {
    root: PathBuf,
}

impl MetricLogger {
    pub fn new(artifact_dir: impl AsRef<Path>) -> Self {
        Self {
            root: artifact_dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn metric_path(&self, split: &str, epoch: usize, metric: &str) -> PathBuf {
        self.root
            .join(split)
            .join(format!("epoch-{epoch}"))
            .join(format!("{metric}.log"))
    }

    /// Append one value. Failures are logged and otherwise ignored so a full
    /// disk never aborts a training run.
    pub fn log(&self, split: &str, epoch: usize, metric: &str, value: f64, step: usize) {
        let path = self.metric_path(split, epoch, metric);
        if let Err(e) = append_line(&path, &format!("{value},{step}")) {
            tracing::warn!("failed to write metric {}: {e}", path.display());
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_value_step_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricLogger::new(dir.path());

        logger.log("train", 1, "Loss", 2.5, 1);
        logger.log("train", 1, "Loss", 1.25, 201);
        logger.log("valid", 1, "Acc@1", 12.0, 1);

        let loss = std::fs::read_to_string(dir.path().join("train/epoch-1/Loss.log")).unwrap();
        assert_eq!(loss, "2.5,1\n1.25,201\n");
        assert!(dir.path().join("valid/epoch-1/Acc@1.log").exists());
    }
}
