use std::{path::Path, time::Instant};

use burn::{data::dataloader::DataLoader, prelude::*};
use resnet_core::{ResNet, resnet::ResNetRecord};
use resnet_data::{
    ClassificationBatch, ImageBatcher, ImageFolder, ImageTransform, Split, image_loader,
    load_classes,
};

use crate::{
    accuracy::accuracy,
    checkpoint::{CheckpointPaths, CheckpointSelector, CheckpointState, load_record},
    error::TrainingError,
    logger::MetricLogger,
    meter::{AverageMeter, ProgressMeter, Summary},
    training::{CLASSES_FILE, CONFIG_FILE, ResNetTrainingConfig, build_model},
};

/// Top-1 and top-5 accuracy over a whole loader, in percent.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalResult {
    pub acc1: f64,
    pub acc5: f64,
    pub num_samples: usize,
}

/// Score `model` on every batch of `loader`.
///
/// Progress goes out every `print_frequency` batches and a summary line at the
/// end. With a logger, `Acc@1` and `Acc@5` are written under `mode` at step
/// `epoch + 1`. Only [`Split::Valid`] and [`Split::Test`] are accepted.
pub fn validate<B: Backend>(
    model: &ResNet<B>,
    loader: &dyn DataLoader<B, ClassificationBatch<B>>,
    batch_size: usize,
    epoch: usize,
    mode: Split,
    print_frequency: usize,
    logger: Option<&MetricLogger>,
) -> Result<EvalResult, TrainingError> {
    if mode.is_train() {
        return Err(TrainingError::InvalidMode(mode));
    }

    let batches = loader.num_items().div_ceil(batch_size.max(1));
    let mut batch_time = AverageMeter::new("Time", 6, 3, Summary::None);
    let mut acc1 = AverageMeter::new("Acc@1", 6, 2, Summary::Average);
    let mut acc5 = AverageMeter::new("Acc@5", 6, 2, Summary::Average);
    let progress = ProgressMeter::new(batches, format!("{mode}: "));

    let mut end = Instant::now();
    for (batch_index, batch) in loader.iter().enumerate() {
        let batch_len = batch.len();
        if batch_len == 0 {
            continue;
        }

        let output = model.forward(batch.images);
        let topk = accuracy(output, batch.targets, &[1, 5]);
        acc1.update(topk[0], batch_len);
        acc5.update(topk[1], batch_len);

        batch_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if batch_index % print_frequency.max(1) == 0 {
            tracing::info!(
                "{}",
                progress.display(batch_index + 1, &[&batch_time, &acc1, &acc5])
            );
        }
    }

    tracing::info!("{}", progress.display_summary(&[&acc1, &acc5]));

    if let Some(logger) = logger {
        logger.log(mode.dir_name(), epoch + 1, "Acc@1", acc1.avg(), epoch + 1);
        logger.log(mode.dir_name(), epoch + 1, "Acc@5", acc5.avg(), epoch + 1);
    }

    Ok(EvalResult {
        acc1: acc1.avg(),
        acc5: acc5.avg(),
        num_samples: acc1.count(),
    })
}

/// Evaluate the averaged weights of a finished or running training.
///
/// The model is rebuilt from `<artifact_dir>/config.json`, labels follow
/// `classes.json`. `data_dir` defaults to the validation directory used in
/// training. Scores are also logged under `test/`.
pub fn evaluate<B: Backend>(
    device: &B::Device,
    artifact_dir: &Path,
    data_dir: Option<&Path>,
    checkpoint: CheckpointSelector,
    batch_size: usize,
    workers: usize,
) -> Result<EvalResult, TrainingError> {
    let config_path = artifact_dir.join(CONFIG_FILE);
    let config = ResNetTrainingConfig::load(&config_path)
        .map_err(|e| TrainingError::Io(config_path.display().to_string(), e))?;
    let classes = load_classes(artifact_dir.join(CLASSES_FILE))?;

    let data_dir = data_dir.map_or_else(
        || Path::new(&config.params.data.valid_dir).to_path_buf(),
        Path::to_path_buf,
    );
    let dataset = ImageFolder::with_classes(&data_dir, classes)?;

    let paths = CheckpointPaths::select(artifact_dir, checkpoint);
    let state = CheckpointState::load(&paths.state)?;
    tracing::info!("Using {checkpoint} checkpoint (epoch {})", state.epoch);

    let model = build_model::<B>(&config.params.model, device);
    let model = model.load_record(load_record::<B, ResNetRecord<B>>(&paths.ema, device)?);

    let transform = ImageTransform::from_config(&config.params.data, Split::Test)?;
    let loader = image_loader::<B, _>(
        dataset,
        ImageBatcher::new(transform, None),
        batch_size,
        workers,
        None,
        device,
    );

    let logger = MetricLogger::new(artifact_dir);
    let epoch = state.epoch.saturating_sub(1);
    validate(
        &model,
        loader.as_ref(),
        batch_size,
        epoch,
        Split::Test,
        config.params.train.valid_print_frequency,
        Some(&logger),
    )
}

#[cfg(test)]
mod tests {
    use resnet_core::test_utils::{TestBackend, test_device, tiny_model};
    use resnet_data::{Normalize, test_utils::write_image_folder};

    use super::*;

    fn valid_loader(
        dir: &Path,
        per_class: usize,
    ) -> std::sync::Arc<dyn DataLoader<TestBackend, ClassificationBatch<TestBackend>>> {
        write_image_folder(dir, &["a", "b", "c"], per_class, 20);
        let folder = ImageFolder::new(dir).unwrap();
        let transform = ImageTransform::new(Split::Valid, 16, 18, Normalize::default());
        image_loader::<TestBackend, _>(
            folder,
            ImageBatcher::new(transform, None),
            2,
            0,
            None,
            &test_device(),
        )
    }

    #[test]
    fn test_train_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let loader = valid_loader(&dir.path().join("val"), 1);
        let result = validate(&tiny_model(3), loader.as_ref(), 2, 0, Split::Train, 1, None);
        assert!(matches!(
            result,
            Err(TrainingError::InvalidMode(Split::Train))
        ));
    }

    #[test]
    fn test_validate_counts_every_sample_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let loader = valid_loader(&dir.path().join("val"), 1);
        let logger = MetricLogger::new(dir.path().join("out"));

        let result = validate(
            &tiny_model(3),
            loader.as_ref(),
            2,
            4,
            Split::Valid,
            1,
            Some(&logger),
        )
        .unwrap();

        assert_eq!(result.num_samples, 3);
        assert!((0.0..=100.0).contains(&result.acc1));
        // three classes, so every target is within the top five
        assert!((result.acc5 - 100.0).abs() < 1e-9);

        let log = std::fs::read_to_string(logger.metric_path("valid", 5, "Acc@1")).unwrap();
        assert!(log.trim_end().ends_with(",5"));
    }

    #[test]
    fn test_test_mode_logs_under_test() {
        let dir = tempfile::tempdir().unwrap();
        let loader = valid_loader(&dir.path().join("val"), 1);
        let logger = MetricLogger::new(dir.path().join("out"));

        validate(&tiny_model(3), loader.as_ref(), 2, 0, Split::Test, 5, Some(&logger)).unwrap();
        assert!(logger.metric_path("test", 1, "Acc@5").exists());
    }
}
