use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use burn::{
    data::{dataloader::DataLoader, dataset::Dataset},
    lr_scheduler::LrScheduler,
    module::{AutodiffModule, DisplaySettings, ModuleDisplay},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{
        GradientsParams, Optimizer, SgdConfig, decay::WeightDecayConfig,
        momentum::MomentumConfig,
    },
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use rand::RngExt;
use resnet_config::{ModelParams, TrainConfig, TrainParams};
use resnet_core::{ModelEma, ResNet, ResNetConfig};
use resnet_data::{
    ClassificationBatch, ImageBatcher, ImageFolder, ImageTransform, Split, image_loader,
    save_classes,
};
use serde::{Deserialize, Serialize};

use crate::{
    accuracy::accuracy,
    checkpoint::{CheckpointState, load_checkpoint, load_pretrained, save_checkpoint},
    error::TrainingError,
    eval::validate,
    logger::MetricLogger,
    meter::{AverageMeter, ProgressMeter, Summary},
    scaler::GradScaler,
    scheduler::CosineAnnealingWarmRestarts,
};

/// Averaged copy of a model trained on `B`, kept on the inner backend.
pub type EmaResNet<B> = ModelEma<
    <B as AutodiffBackend>::InnerBackend,
    ResNet<<B as AutodiffBackend>::InnerBackend>,
>;

pub const CONFIG_FILE: &str = "config.json";
pub const CLASSES_FILE: &str = "classes.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResNetTrainingConfig {
    #[serde(flatten)]
    pub params: TrainParams,
    /// Artifact directory for checkpoints, metric logs and the class list
    pub artifact_dir: String,
    /// Completed epochs of the checkpoint to resume from
    #[serde(default)]
    pub resume_epoch: Option<usize>,
}

impl ResNetTrainingConfig {
    #[must_use]
    pub fn new(params: TrainParams, artifact_dir: String) -> Self {
        Self {
            params,
            artifact_dir,
            resume_epoch: None,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Keys missing from the file take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(std::io::Error::other)
    }

    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        PathBuf::from(&self.artifact_dir)
    }
}

/// Per-epoch training averages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
    pub batches: usize,
    /// Optimizer steps skipped because of non-finite gradients.
    pub skipped_steps: usize,
}

/// Outcome of [`train`].
#[derive(Clone, Debug, PartialEq)]
pub struct TrainSummary {
    pub start_epoch: usize,
    pub epochs_completed: usize,
    pub best_acc1: f64,
    pub last_acc1: Option<f64>,
}

pub fn build_model<B: Backend>(params: &ModelParams, device: &B::Device) -> ResNet<B> {
    ResNetConfig::from(params).init(device)
}

/// Cross entropy with label smoothing.
pub fn define_loss<B: Backend>(config: &TrainConfig, device: &B::Device) -> CrossEntropyLoss<B> {
    let smoothing = (config.label_smoothing > 0.0).then_some(config.label_smoothing);
    CrossEntropyLossConfig::new()
        .with_smoothing(smoothing)
        .init(device)
}

/// SGD with momentum and weight decay, no dampening, no Nesterov.
pub fn define_optimizer<B: AutodiffBackend>(config: &TrainConfig) -> impl Optimizer<ResNet<B>, B> {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0)
                .with_nesterov(false),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)))
        .init()
}

#[must_use]
pub fn define_scheduler(config: &TrainConfig) -> CosineAnnealingWarmRestarts {
    CosineAnnealingWarmRestarts::from_config(config)
}

/// One pass over `loader` at learning rate `lr`.
///
/// Batches shorter than `config.batch` are dropped. After every optimizer step
/// the averaged model in `ema` is updated.
pub fn train_one_epoch<B, O>(
    mut model: ResNet<B>,
    ema: &mut EmaResNet<B>,
    loader: &dyn DataLoader<B, ClassificationBatch<B>>,
    criterion: &CrossEntropyLoss<B>,
    optim: &mut O,
    scaler: &mut GradScaler,
    lr: f64,
    epoch: usize,
    config: &TrainConfig,
    logger: &MetricLogger,
) -> (ResNet<B>, EpochStats)
where
    B: AutodiffBackend,
    O: Optimizer<ResNet<B>, B>,
{
    let batches = loader.num_items() / config.batch;

    let mut batch_time = AverageMeter::new("Time", 6, 3, Summary::None);
    let mut data_time = AverageMeter::new("Data", 6, 3, Summary::None);
    let mut losses = AverageMeter::new("Loss", 6, 6, Summary::None);
    let mut acc1 = AverageMeter::new("Acc@1", 6, 2, Summary::Average);
    let mut acc5 = AverageMeter::new("Acc@5", 6, 2, Summary::Average);
    let progress = ProgressMeter::new(batches, format!("Epoch: [{}]", epoch + 1));

    let mut steps = 0;
    let mut skipped_steps = 0;
    let mut end = Instant::now();

    let full_batches = loader.iter().filter(|batch| batch.len() == config.batch);
    for (batch_index, batch) in full_batches.enumerate() {
        data_time.update(end.elapsed().as_secs_f64(), 1);
        let batch_size = batch.len();
        steps += 1;

        let output = model.forward(batch.images);
        let loss = criterion
            .forward(output.clone(), batch.targets.clone())
            .mul_scalar(config.loss_weight);

        let grads = scaler.scale_loss(loss.clone()).backward();
        let grads = GradientsParams::from_grads(grads, &model);
        let (grads, found_inf) = scaler.unscale(&model, grads);
        if found_inf {
            skipped_steps += 1;
        } else {
            model = optim.step(lr, model, grads);
        }
        scaler.update(found_inf);

        ema.update(&model.valid());

        let topk = accuracy(output.inner(), batch.targets.inner(), &[1, 5]);
        losses.update(loss.into_scalar().elem::<f64>(), batch_size);
        acc1.update(topk[0], batch_size);
        acc5.update(topk[1], batch_size);

        batch_time.update(end.elapsed().as_secs_f64(), 1);
        end = Instant::now();

        if batch_index % config.train_print_frequency == 0 {
            let step = batch_index + epoch * batches + 1;
            logger.log("train", epoch + 1, "Loss", losses.val(), step);
            tracing::info!(
                "{}",
                progress.display(
                    batch_index + 1,
                    &[&batch_time, &data_time, &losses, &acc1, &acc5]
                )
            );
        }
    }

    if skipped_steps > 0 {
        tracing::warn!(
            "epoch {}: skipped {skipped_steps} steps on non-finite gradients, loss scale now {}",
            epoch + 1,
            scaler.scale()
        );
    }

    let stats = EpochStats {
        loss: losses.avg(),
        acc1: acc1.avg(),
        acc5: acc5.avg(),
        batches: steps,
        skipped_steps,
    };
    (model, stats)
}

/// Whether the checkpoint of epoch index `epoch` becomes `best/` and `last/`.
///
/// Only a strict improvement counts as best, so a run that never scores above
/// zero has no `best/`.
fn checkpoint_flags(acc1: f64, best_acc1: f64, epoch: usize, epochs: usize) -> (bool, bool) {
    (acc1 > best_acc1, epoch + 1 == epochs)
}

/// Run the full training loop described by `config`.
///
/// Checkpoints land in `<artifact_dir>/checkpoint` after every epoch, with copies
/// of the best and final epochs in `best/` and `last/`.
pub fn train<B: AutodiffBackend>(
    device: &B::Device,
    config: &ResNetTrainingConfig,
) -> Result<TrainSummary, TrainingError> {
    let params = &config.params;
    params.validate()?;
    let train_config = &params.train;

    let artifact_dir = config.artifact_path();
    std::fs::create_dir_all(&artifact_dir)
        .map_err(|e| TrainingError::Io(artifact_dir.display().to_string(), e))?;
    let config_path = artifact_dir.join(CONFIG_FILE);
    config
        .save(&config_path)
        .map_err(|e| TrainingError::Io(config_path.display().to_string(), e))?;

    let train_set = ImageFolder::new(&params.data.train_dir)?;
    if train_set.num_classes() > params.model.num_classes {
        return Err(TrainingError::ClassMismatch {
            dir: params.data.train_dir.clone(),
            model: params.model.num_classes,
            data: train_set.num_classes(),
        });
    }
    if train_set.num_classes() < params.model.num_classes {
        tracing::warn!(
            "{} classes found, classifier has {} outputs",
            train_set.num_classes(),
            params.model.num_classes
        );
    }
    if train_set.len() < train_config.batch {
        return Err(TrainingError::TooFewImages(
            params.data.train_dir.clone(),
            train_config.batch,
        ));
    }
    save_classes(train_set.classes(), artifact_dir.join(CLASSES_FILE))?;
    let valid_set = ImageFolder::with_classes(&params.data.valid_dir, train_set.classes().to_vec())?;

    let seed = params.seed.unwrap_or_else(|| rand::rng().random());
    tracing::info!("data seed: {seed}");

    let train_transform = ImageTransform::from_config(&params.data, Split::Train)?;
    let valid_transform = train_transform.for_split(Split::Valid);
    let train_loader = image_loader::<B, _>(
        train_set,
        ImageBatcher::new(train_transform, Some(seed)),
        train_config.batch,
        train_config.workers,
        Some(seed),
        device,
    );
    let valid_loader = image_loader::<B::InnerBackend, _>(
        valid_set,
        ImageBatcher::new(valid_transform, Some(seed)),
        train_config.batch,
        train_config.workers,
        None,
        device,
    );

    let mut model = build_model::<B>(&params.model, device);
    if let Some(path) = &params.pretrained {
        model = load_pretrained(model, Path::new(path), device)?;
    }
    tracing::info!("{} with {} parameters", params.model.arch, model.num_params());
    let mut ema: EmaResNet<B> = ModelEma::new(model.valid(), train_config.ema_decay);

    let criterion = define_loss::<B>(train_config, device);
    let mut optim = define_optimizer::<B>(train_config);
    let mut scheduler = define_scheduler(train_config);
    let mut scaler = GradScaler::from_params(params)?;
    tracing::info!(
        "{} training, loss scaling {}",
        params.dtype,
        if scaler.is_enabled() { "on" } else { "off" }
    );

    let mut start_epoch = 0;
    let mut best_acc1 = 0.0;
    if let Some(epoch) = config.resume_epoch {
        let (resumed_model, resumed_ema, resumed_optim, state) = load_checkpoint(
            &artifact_dir,
            epoch,
            model,
            optim,
            train_config.ema_decay,
            device,
        )?;
        model = resumed_model;
        ema = resumed_ema;
        optim = resumed_optim;
        start_epoch = state.epoch;
        best_acc1 = state.best_acc1;
        scheduler = scheduler.with_step(state.scheduler_step);
        scaler = scaler.with_state(state.scaler);
        tracing::info!("resumed from epoch {start_epoch}, best Acc@1 {best_acc1:.3}");
    }

    if params.dry_run {
        tracing::info!(
            "Model: {}",
            model.format(DisplaySettings::new().with_show_num_parameters(true))
        );
        tracing::info!("Dry run completed");
        return Ok(TrainSummary {
            start_epoch,
            epochs_completed: start_epoch,
            best_acc1,
            last_acc1: None,
        });
    }

    let logger = MetricLogger::new(&artifact_dir);
    let mut last_acc1 = None;

    for epoch in start_epoch..train_config.epochs {
        let lr = LrScheduler::step(&mut scheduler);
        logger.log("train", epoch + 1, "LearningRate", lr, epoch + 1);

        let (trained, stats) = train_one_epoch(
            model,
            &mut ema,
            train_loader.as_ref(),
            &criterion,
            &mut optim,
            &mut scaler,
            lr,
            epoch,
            train_config,
            &logger,
        );
        model = trained;
        logger.log("train", epoch + 1, "Acc@1", stats.acc1, epoch + 1);
        logger.log("train", epoch + 1, "Acc@5", stats.acc5, epoch + 1);
        if scaler.is_enabled() {
            logger.log("train", epoch + 1, "LossScale", f64::from(scaler.scale()), epoch + 1);
        }

        let result = validate(
            ema.model(),
            valid_loader.as_ref(),
            train_config.batch,
            epoch,
            Split::Valid,
            train_config.valid_print_frequency,
            Some(&logger),
        )?;

        let (is_best, is_last) =
            checkpoint_flags(result.acc1, best_acc1, epoch, train_config.epochs);
        best_acc1 = result.acc1.max(best_acc1);
        last_acc1 = Some(result.acc1);

        let state = CheckpointState {
            epoch: epoch + 1,
            best_acc1,
            scheduler_step: scheduler.step_count(),
            ema_num_averaged: ema.num_averaged(),
            scaler: scaler.state(),
        };
        save_checkpoint(&artifact_dir, &model, &ema, &optim, &state, is_best, is_last)?;
        tracing::info!(
            "epoch {} done: train loss {:.4}, valid Acc@1 {:.3}, best {best_acc1:.3}",
            epoch + 1,
            stats.loss,
            result.acc1
        );
    }

    tracing::info!("Training completed! Artifacts saved to: {}", config.artifact_dir);
    Ok(TrainSummary {
        start_epoch,
        epochs_completed: train_config.epochs,
        best_acc1,
        last_acc1,
    })
}
