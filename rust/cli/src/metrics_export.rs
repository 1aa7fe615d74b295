//! CSV export of the metric logs written during training and evaluation.
//!
//! Output is one tidy table per split (`experiment,epoch,step,metric,value`),
//! written next to the requested output path as `<stem>_<split>.csv`.

use std::path::{Path, PathBuf};

use clap::ValueEnum;

/// Metric logs the exporter knows how to read.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum MetricType {
    Loss,
    Acc1,
    Acc5,
    LearningRate,
    LossScale,
}

impl MetricType {
    fn filename(self) -> &'static str {
        match self {
            MetricType::Loss => "Loss.log",
            MetricType::Acc1 => "Acc@1.log",
            MetricType::Acc5 => "Acc@5.log",
            MetricType::LearningRate => "LearningRate.log",
            MetricType::LossScale => "LossScale.log",
        }
    }

    fn column_name(self) -> &'static str {
        match self {
            MetricType::Loss => "loss",
            MetricType::Acc1 => "acc1",
            MetricType::Acc5 => "acc5",
            MetricType::LearningRate => "learning_rate",
            MetricType::LossScale => "loss_scale",
        }
    }
}

/// What to export and how to thin it out.
pub struct ExportConfig {
    pub metrics: Vec<MetricType>,
    pub include_train: bool,
    pub include_valid: bool,
    pub include_test: bool,
    pub target_points: Option<usize>,
    pub window: Option<usize>,
}

impl ExportConfig {
    fn splits(&self) -> Vec<&'static str> {
        [
            (self.include_train, "train"),
            (self.include_valid, "valid"),
            (self.include_test, "test"),
        ]
        .into_iter()
        .filter_map(|(enabled, split)| enabled.then_some(split))
        .collect()
    }
}

/// One `experiment,epoch,step,metric,value` line.
#[derive(Debug, PartialEq)]
struct MetricRow {
    experiment: String,
    epoch: usize,
    step: usize,
    metric: MetricType,
    value: f64,
}

/// `(step, value)` pairs of a `value,step` log. Malformed lines are ignored.
fn read_series(path: &Path) -> Option<Vec<(usize, f64)>> {
    let content = std::fs::read_to_string(path).ok()?;
    let values: Vec<(usize, f64)> = content
        .lines()
        .filter_map(|line| {
            let (value, step) = line.split_once(',')?;
            Some((step.trim().parse().ok()?, value.trim().parse().ok()?))
        })
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Average consecutive points into buckets so about `target` remain.
fn downsample_buckets(values: &[(usize, f64)], target: usize) -> Vec<(usize, f64)> {
    if values.len() <= target || target == 0 {
        return values.to_vec();
    }

    let bucket_size = values.len() / target;
    values
        .chunks(bucket_size)
        .map(|chunk| {
            let avg_step = chunk.iter().map(|(s, _)| *s).sum::<usize>() / chunk.len();
            let avg_value = chunk.iter().map(|(_, v)| *v).sum::<f64>() / chunk.len() as f64;
            (avg_step, avg_value)
        })
        .collect()
}

/// Centered moving average over `window` points, truncated at the ends.
fn apply_rolling_average(values: &[(usize, f64)], window: usize) -> Vec<(usize, f64)> {
    if window <= 1 {
        return values.to_vec();
    }

    let half = window / 2;
    let mut prefix = Vec::with_capacity(values.len() + 1);
    prefix.push(0.0);
    for (_, v) in values {
        prefix.push(prefix[prefix.len() - 1] + v);
    }

    values
        .iter()
        .enumerate()
        .map(|(i, &(step, _))| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            (step, (prefix[hi] - prefix[lo]) / (hi - lo) as f64)
        })
        .collect()
}

/// Artifact directories matched by `patterns`, sorted and deduplicated.
fn expand_globs(patterns: &[String]) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();

    for pattern in patterns {
        let matches: Vec<PathBuf> = glob::glob(pattern)?.flatten().collect();

        if matches.is_empty() {
            // a literal path that glob could not see
            let literal = PathBuf::from(pattern);
            if literal.exists() {
                paths.push(literal);
            } else {
                tracing::warn!("No matches for pattern '{pattern}'");
            }
        } else {
            paths.extend(matches);
        }
    }

    paths.retain(|p| p.is_dir());
    paths.sort();
    paths.dedup();

    Ok(paths)
}

fn experiment_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "unknown".into(), |n| n.to_string_lossy().into_owned())
}

/// Collect all epoch directories from a split dir, sorted by epoch.
fn collect_epochs(metrics_dir: &Path) -> Vec<(usize, PathBuf)> {
    let mut epochs: Vec<(usize, PathBuf)> = std::fs::read_dir(metrics_dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let epoch = name.strip_prefix("epoch-")?.parse::<usize>().ok()?;
            Some((epoch, entry.path()))
        })
        .collect();

    epochs.sort_by_key(|(e, _)| *e);
    epochs
}

fn postprocess(mut data: Vec<(usize, f64)>, config: &ExportConfig) -> Vec<(usize, f64)> {
    if let Some(window) = config.window {
        data = apply_rolling_average(&data, window);
    }
    if let Some(target) = config.target_points {
        data = downsample_buckets(&data, target);
    }
    data
}

/// The epoch owning `step`: the last epoch whose first step is not after it.
fn epoch_of(step: usize, boundaries: &[(usize, usize)]) -> usize {
    boundaries
        .iter()
        .rev()
        .find(|(_, start)| step >= *start)
        .or(boundaries.first())
        .map_or(1, |(epoch, _)| *epoch)
}

/// Tidy rows of one split of one run.
///
/// Training series are smoothed across epoch boundaries since their steps are
/// global batch counts. Evaluation series are processed per epoch: each epoch
/// scores a different checkpoint and blending them would be misleading.
fn collect_split_metrics(dir: &Path, split: &str, config: &ExportConfig) -> Vec<MetricRow> {
    let experiment = experiment_name(dir);
    let epochs = collect_epochs(&dir.join(split));
    let cross_epoch = split == "train";

    let mut rows = Vec::new();
    for &metric in &config.metrics {
        let per_epoch: Vec<(usize, Vec<(usize, f64)>)> = epochs
            .iter()
            .filter_map(|(epoch, path)| {
                Some((*epoch, read_series(&path.join(metric.filename()))?))
            })
            .collect();

        if cross_epoch {
            let boundaries: Vec<(usize, usize)> = per_epoch
                .iter()
                .map(|(epoch, data)| (*epoch, data[0].0))
                .collect();
            let series = per_epoch.into_iter().flat_map(|(_, data)| data).collect();
            for (step, value) in postprocess(series, config) {
                rows.push(MetricRow {
                    experiment: experiment.clone(),
                    epoch: epoch_of(step, &boundaries),
                    step,
                    metric,
                    value,
                });
            }
        } else {
            for (epoch, data) in per_epoch {
                for (step, value) in postprocess(data, config) {
                    rows.push(MetricRow {
                        experiment: experiment.clone(),
                        epoch,
                        step,
                        metric,
                        value,
                    });
                }
            }
        }
    }

    rows.sort_by_key(|r| (r.step, r.epoch));
    rows
}

fn write_csv(rows: &[MetricRow], output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;

    let mut file = std::io::BufWriter::new(std::fs::File::create(output)?);
    writeln!(file, "experiment,epoch,step,metric,value")?;
    for row in rows {
        writeln!(
            file,
            "{},{},{},{},{}",
            row.experiment,
            row.epoch,
            row.step,
            row.metric.column_name(),
            row.value
        )?;
    }
    file.flush()?;

    Ok(())
}

/// `metrics.csv` + `valid` gives `metrics_valid.csv`, next to the base path.
fn output_path_for_split(base: &str, split: &str) -> PathBuf {
    let base = Path::new(base);
    let mut name = base.file_stem().unwrap_or_default().to_os_string();
    name.push(format!("_{split}"));
    if let Some(ext) = base.extension() {
        name.push(".");
        name.push(ext);
    }
    base.with_file_name(name)
}

/// Write one CSV per requested split that has data.
pub fn export_metrics(
    dirs: Vec<String>,
    output: &str,
    config: ExportConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let paths = expand_globs(&dirs)?;

    if paths.is_empty() {
        return Err("none of the given paths is an artifact directory".into());
    }

    println!("Reading metrics of {} runs", paths.len());

    let mut written = 0;
    for split in config.splits() {
        let mut rows = Vec::new();
        for path in &paths {
            let split_rows = collect_split_metrics(path, split, &config);
            if !split_rows.is_empty() {
                println!(
                    "  {}: {} {split} data points",
                    experiment_name(path),
                    split_rows.len()
                );
                rows.extend(split_rows);
            }
        }

        if rows.is_empty() {
            continue;
        }

        let split_path = output_path_for_split(output, split);
        write_csv(&rows, &split_path)?;
        println!("Wrote {} rows to {}", rows.len(), split_path.display());
        written += 1;
    }

    if written == 0 {
        return Err("no metric logs found for the selected splits".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use resnet_training::MetricLogger;
    use test_case::test_case;

    use super::*;

    fn config(metrics: Vec<MetricType>) -> ExportConfig {
        ExportConfig {
            metrics,
            include_train: true,
            include_valid: true,
            include_test: false,
            target_points: None,
            window: None,
        }
    }

    #[test_case("metrics.csv", "train", "metrics_train.csv" ; "with extension")]
    #[test_case("out/metrics", "valid", "out/metrics_valid" ; "without extension")]
    #[test_case("runs/m.csv", "test", "runs/m_test.csv" ; "nested")]
    fn test_output_path_for_split(base: &str, split: &str, expected: &str) {
        assert_eq!(output_path_for_split(base, split), PathBuf::from(expected));
    }

    #[test]
    fn test_rolling_average_keeps_steps() {
        let data = vec![(1, 1.0), (2, 2.0), (3, 3.0)];
        let smoothed = apply_rolling_average(&data, 3);
        assert_eq!(smoothed, vec![(1, 1.5), (2, 2.0), (3, 2.5)]);
    }

    #[test]
    fn test_downsample_averages_buckets() {
        let data: Vec<(usize, f64)> = (1..=8).map(|s| (s, s as f64)).collect();
        assert_eq!(
            downsample_buckets(&data, 4),
            vec![(1, 1.5), (3, 3.5), (5, 5.5), (7, 7.5)]
        );
        assert_eq!(downsample_buckets(&data, 20).len(), 8);
    }

    #[test]
    fn test_train_rows_use_logged_steps() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run-a");
        let logger = MetricLogger::new(&run);
        logger.log("train", 1, "Loss", 2.0, 1);
        logger.log("train", 1, "Loss", 1.5, 3);
        logger.log("train", 2, "Loss", 1.0, 5);
        logger.log("train", 2, "Acc@1", 40.0, 2);

        let rows = collect_split_metrics(&run, "train", &config(vec![MetricType::Loss]));
        let summary: Vec<_> = rows.iter().map(|r| (r.epoch, r.step, r.value)).collect();
        assert_eq!(summary, vec![(1, 1, 2.0), (1, 3, 1.5), (2, 5, 1.0)]);
        assert!(rows.iter().all(|r| r.experiment == "run-a"));
    }

    #[test]
    fn test_export_writes_one_file_per_split() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run");
        let logger = MetricLogger::new(&run);
        logger.log("train", 1, "Loss", 2.0, 1);
        logger.log("valid", 1, "Acc@1", 10.0, 1);
        logger.log("valid", 2, "Acc@1", 30.0, 2);

        let output = dir.path().join("metrics.csv");
        export_metrics(
            vec![run.display().to_string()],
            output.to_str().unwrap(),
            config(vec![MetricType::Loss, MetricType::Acc1]),
        )
        .unwrap();

        let valid = std::fs::read_to_string(dir.path().join("metrics_valid.csv")).unwrap();
        assert_eq!(
            valid,
            "experiment,epoch,step,metric,value\nrun,1,1,acc1,10\nrun,2,2,acc1,30\n"
        );
        let train = std::fs::read_to_string(dir.path().join("metrics_train.csv")).unwrap();
        assert_eq!(train.lines().count(), 2);
        assert!(!dir.path().join("metrics_test.csv").exists());
    }

    #[test]
    fn test_export_without_metrics_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("metrics.csv");
        let result = export_metrics(
            vec![dir.path().display().to_string()],
            output.to_str().unwrap(),
            config(vec![MetricType::Loss]),
        );
        assert!(result.is_err());
    }
}
