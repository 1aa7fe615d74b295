//! Per-epoch checkpoints.
//!
//! ```text
//! <artifact_dir>/checkpoint/{model,ema,optim}-<n>.mpk
//! <artifact_dir>/checkpoint/state-<n>.json
//! <artifact_dir>/best/{model,ema,optim}.mpk, state.json
//! <artifact_dir>/last/{model,ema,optim}.mpk, state.json
//! ```
//!
//! `n` counts completed epochs, so resuming from `n` starts epoch index `n`.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    prelude::*,
    record::{DefaultRecorder, Record, Recorder, RecorderError},
    tensor::backend::AutodiffBackend,
};
use resnet_core::{ModelEma, ResNet, resnet::ResNetRecord};
use serde::{Deserialize, Serialize};

use crate::{scaler::ScalerState, training::EmaResNet};

pub const CHECKPOINT_DIR: &str = "checkpoint";
pub const BEST_DIR: &str = "best";
pub const LAST_DIR: &str = "last";

const RECORD_EXT: &str = "mpk";

/// Everything needed to resume besides the tensors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed epochs.
    pub epoch: usize,
    pub best_acc1: f64,
    pub scheduler_step: usize,
    pub ema_num_averaged: u64,
    pub scaler: ScalerState,
}

impl CheckpointState {
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CheckpointError::State(path.display().to_string(), e))?;
        std::fs::write(path, json).map_err(|e| CheckpointError::Io(path.display().to_string(), e))
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CheckpointError::Io(path.display().to_string(), e))?;
        serde_json::from_str(&json).map_err(|e| CheckpointError::State(path.display().to_string(), e))
    }
}

/// Which saved weights to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointSelector {
    Best,
    Last,
    Epoch(usize),
}

impl FromStr for CheckpointSelector {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best" => Ok(Self::Best),
            "last" => Ok(Self::Last),
            other => other
                .parse()
                .map(Self::Epoch)
                .map_err(|_| CheckpointError::UnknownSelector(s.to_string())),
        }
    }
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => write!(f, "best"),
            Self::Last => write!(f, "last"),
            Self::Epoch(epoch) => write!(f, "{epoch}"),
        }
    }
}

/// File locations of one checkpoint. Record paths carry no extension, the
/// recorder appends it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub ema: PathBuf,
    pub optim: PathBuf,
    pub state: PathBuf,
}

impl CheckpointPaths {
    #[must_use]
    pub fn epoch(artifact_dir: &Path, epoch: usize) -> Self {
        let dir = artifact_dir.join(CHECKPOINT_DIR);
        Self {
            model: dir.join(format!("model-{epoch}")),
            ema: dir.join(format!("ema-{epoch}")),
            optim: dir.join(format!("optim-{epoch}")),
            state: dir.join(format!("state-{epoch}.json")),
        }
    }

    #[must_use]
    pub fn named(artifact_dir: &Path, name: &str) -> Self {
        let dir = artifact_dir.join(name);
        Self {
            model: dir.join("model"),
            ema: dir.join("ema"),
            optim: dir.join("optim"),
            state: dir.join("state.json"),
        }
    }

    #[must_use]
    pub fn select(artifact_dir: &Path, selector: CheckpointSelector) -> Self {
        match selector {
            CheckpointSelector::Best => Self::named(artifact_dir, BEST_DIR),
            CheckpointSelector::Last => Self::named(artifact_dir, LAST_DIR),
            CheckpointSelector::Epoch(epoch) => Self::epoch(artifact_dir, epoch),
        }
    }

    /// On-disk files, with extensions.
    fn files(&self) -> [PathBuf; 4] {
        [
            self.model.with_extension(RECORD_EXT),
            self.ema.with_extension(RECORD_EXT),
            self.optim.with_extension(RECORD_EXT),
            self.state.clone(),
        ]
    }

    /// Whether every file of the checkpoint is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.files().iter().all(|path| path.exists())
    }

    /// Copy all files over those of `dest`.
    pub fn copy_to(&self, dest: &Self) -> Result<(), CheckpointError> {
        for (src, dst) in self.files().iter().zip(dest.files()) {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CheckpointError::Io(parent.display().to_string(), e))?;
            }
            std::fs::copy(src, &dst)
                .map_err(|e| CheckpointError::Io(src.display().to_string(), e))?;
        }
        Ok(())
    }
}

/// Latest epoch whose checkpoint files are all present.
#[must_use]
pub fn find_latest_checkpoint(artifact_dir: &Path) -> Option<usize> {
    let checkpoint_dir = artifact_dir.join(CHECKPOINT_DIR);
    std::fs::read_dir(&checkpoint_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_prefix("state-")?
                .strip_suffix(".json")?
                .parse::<usize>()
                .ok()
        })
        .filter(|&epoch| {
            let complete = CheckpointPaths::epoch(artifact_dir, epoch).is_complete();
            if !complete {
                tracing::warn!("checkpoint {epoch} is incomplete, skipping");
            }
            complete
        })
        .max()
}

pub fn save_record<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CheckpointError::Io(parent.display().to_string(), e))?;
    }
    Recorder::<B>::record(&DefaultRecorder::new(), record, path.to_path_buf())
        .map_err(|e| CheckpointError::Record(path.display().to_string(), e))
}

pub fn load_record<B: Backend, R: Record<B>>(
    path: &Path,
    device: &B::Device,
) -> Result<R, CheckpointError> {
    Recorder::<B>::load(&DefaultRecorder::new(), path.to_path_buf(), device)
        .map_err(|e| CheckpointError::Record(path.display().to_string(), e))
}

/// Write the checkpoint of `state.epoch` and refresh `best/` and `last/` as asked.
pub fn save_checkpoint<B, O>(
    artifact_dir: &Path,
    model: &ResNet<B>,
    ema: &EmaResNet<B>,
    optim: &O,
    state: &CheckpointState,
    is_best: bool,
    is_last: bool,
) -> Result<CheckpointPaths, CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<ResNet<B>, B>,
{
    let paths = CheckpointPaths::epoch(artifact_dir, state.epoch);
    save_record::<B, _>(model.clone().into_record(), &paths.model)?;
    save_record::<B::InnerBackend, _>(ema.model().clone().into_record(), &paths.ema)?;
    save_record::<B, _>(optim.to_record(), &paths.optim)?;
    // state goes last, it marks the checkpoint as usable
    state.save(&paths.state)?;

    if is_best {
        paths.copy_to(&CheckpointPaths::named(artifact_dir, BEST_DIR))?;
    }
    if is_last {
        paths.copy_to(&CheckpointPaths::named(artifact_dir, LAST_DIR))?;
    }
    tracing::debug!("saved checkpoint {}", state.epoch);
    Ok(paths)
}

/// Restore model, averaged model, optimizer and state saved after `epoch` epochs.
pub fn load_checkpoint<B, O>(
    artifact_dir: &Path,
    epoch: usize,
    model: ResNet<B>,
    optim: O,
    ema_decay: f64,
    device: &B::Device,
) -> Result<(ResNet<B>, EmaResNet<B>, O, CheckpointState), CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<ResNet<B>, B>,
{
    let paths = CheckpointPaths::epoch(artifact_dir, epoch);
    let state = CheckpointState::load(&paths.state)?;

    let ema_record =
        load_record::<B::InnerBackend, ResNetRecord<B::InnerBackend>>(&paths.ema, device)?;
    let ema = ModelEma::from_parts(
        model.valid().load_record(ema_record),
        ema_decay,
        state.ema_num_averaged,
    );
    let model_record = load_record::<B, ResNetRecord<B>>(&paths.model, device)?;
    let model = model.load_record(model_record);
    let optim = optim.load_record(load_record::<B, O::Record>(&paths.optim, device)?);

    Ok((model, ema, optim, state))
}

/// Load model weights from a record file, keeping the fresh classifier when
/// the stored one was trained for a different number of classes.
pub fn load_pretrained<B: Backend>(
    model: ResNet<B>,
    path: &Path,
    device: &B::Device,
) -> Result<ResNet<B>, CheckpointError> {
    let path = path.with_extension("");
    let mut record = load_record::<B, ResNetRecord<B>>(&path, device)?;

    let stored = record.fc.weight.val().dims();
    let expected = model.fc.weight.val().dims();
    if stored != expected {
        tracing::warn!(
            "pretrained classifier has shape {stored:?}, model expects {expected:?}; keeping the fresh head"
        );
        record.fc = model.fc.clone().into_record();
    }

    tracing::info!("loaded pretrained weights from {}", path.display());
    Ok(model.load_record(record))
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to access {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to save or load record {0}: {1}")]
    Record(String, RecorderError),
    #[error("invalid checkpoint state {0}: {1}")]
    State(String, serde_json::Error),
    #[error("unknown checkpoint {0:?}, expected best, last or an epoch number")]
    UnknownSelector(String),
}

#[cfg(test)]
mod tests {
    use burn::optim::GradientsParams;
    use resnet_config::TrainConfig;
    use resnet_core::test_utils::{
        TestAutodiffBackend, TestBackend, random_images, test_device, tiny_config, tiny_model,
    };

    use super::*;
    use crate::training::define_optimizer;

    fn state(epoch: usize) -> CheckpointState {
        CheckpointState {
            epoch,
            best_acc1: 12.5,
            scheduler_step: epoch,
            ema_num_averaged: 40,
            scaler: ScalerState {
                scale: 1024.0,
                growth_tracker: 3,
            },
        }
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("best".parse::<CheckpointSelector>().unwrap(), CheckpointSelector::Best);
        assert_eq!("LAST".parse::<CheckpointSelector>().unwrap(), CheckpointSelector::Last);
        assert_eq!(
            "12".parse::<CheckpointSelector>().unwrap(),
            CheckpointSelector::Epoch(12)
        );
        assert!(matches!(
            "newest".parse::<CheckpointSelector>(),
            Err(CheckpointError::UnknownSelector(_))
        ));
    }

    #[test]
    fn test_paths_layout() {
        let paths = CheckpointPaths::epoch(Path::new("/runs/a"), 3);
        assert_eq!(paths.model, Path::new("/runs/a/checkpoint/model-3"));
        assert_eq!(paths.state, Path::new("/runs/a/checkpoint/state-3.json"));

        let best = CheckpointPaths::select(Path::new("/runs/a"), CheckpointSelector::Best);
        assert_eq!(best.ema, Path::new("/runs/a/best/ema"));
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        state(4).save(&path).unwrap();
        assert_eq!(CheckpointState::load(&path).unwrap(), state(4));
    }

    #[test]
    fn test_copy_to_best() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::epoch(dir.path(), 2);
        std::fs::create_dir_all(dir.path().join(CHECKPOINT_DIR)).unwrap();
        for file in paths.files() {
            std::fs::write(file, b"x").unwrap();
        }

        let best = CheckpointPaths::named(dir.path(), BEST_DIR);
        assert!(!best.is_complete());
        paths.copy_to(&best).unwrap();
        assert!(best.is_complete());
        assert!(dir.path().join("best/model.mpk").exists());
    }

    #[test]
    fn test_model_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        let model = tiny_model(3);
        save_record::<TestBackend, _>(model.clone().into_record(), &path).unwrap();
        assert!(dir.path().join("model.mpk").exists());

        let record =
            load_record::<TestBackend, ResNetRecord<TestBackend>>(&path, &test_device()).unwrap();
        let loaded = tiny_model(3).load_record(record);
        loaded
            .fc
            .weight
            .val()
            .into_data()
            .assert_eq(&model.fc.weight.val().into_data(), true);
    }

    #[test]
    fn test_pretrained_with_other_head_keeps_fresh_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretrained.mpk");
        let pretrained = tiny_model(10);
        save_record::<TestBackend, _>(pretrained.clone().into_record(), &path.with_extension(""))
            .unwrap();

        let fresh = tiny_model(4);
        let fresh_fc = fresh.fc.weight.val().into_data();
        let loaded = load_pretrained(fresh, &path, &test_device()).unwrap();

        assert_eq!(loaded.num_classes(), 4);
        loaded.fc.weight.val().into_data().assert_eq(&fresh_fc, true);
        loaded
            .conv1
            .weight
            .val()
            .into_data()
            .assert_eq(&pretrained.conv1.weight.val().into_data(), true);
    }

    fn max_diff<B: Backend>(a: &ResNet<B>, b: &ResNet<B>) -> f32 {
        let a = a.fc.weight.val().into_data().to_vec::<f32>().unwrap();
        let b = b.fc.weight.val().into_data().to_vec::<f32>().unwrap();
        a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    fn sgd_step<O: Optimizer<ResNet<TestAutodiffBackend>, TestAutodiffBackend>>(
        model: ResNet<TestAutodiffBackend>,
        optim: &mut O,
        images: Tensor<TestAutodiffBackend, 4>,
    ) -> ResNet<TestAutodiffBackend> {
        let grads = model.forward(images).powi_scalar(2).mean().backward();
        let grads = GradientsParams::from_grads(grads, &model);
        optim.step(0.1, model, grads)
    }

    #[test]
    fn test_checkpoint_restores_training_state() {
        let dir = tempfile::tempdir().unwrap();
        let device = test_device();
        let config = TrainConfig::default();
        let images = Tensor::<TestAutodiffBackend, 4>::from_inner(random_images(2, 16));

        let mut optim = define_optimizer::<TestAutodiffBackend>(&config);
        let model = sgd_step(tiny_config(3).init(&device), &mut optim, images.clone());
        let mut ema: EmaResNet<TestAutodiffBackend> = ModelEma::new(model.valid(), 0.5);
        ema.update(&model.valid());
        ema.update(&model.valid());

        save_checkpoint(dir.path(), &model, &ema, &optim, &state(1), true, false).unwrap();
        assert!(CheckpointPaths::named(dir.path(), BEST_DIR).is_complete());
        assert!(!CheckpointPaths::named(dir.path(), LAST_DIR).is_complete());

        let (restored, restored_ema, mut restored_optim, restored_state) = load_checkpoint(
            dir.path(),
            1,
            tiny_config(3).init::<TestAutodiffBackend>(&device),
            define_optimizer::<TestAutodiffBackend>(&config),
            0.5,
            &device,
        )
        .unwrap();

        assert_eq!(restored_state, state(1));
        assert_eq!(restored_ema.num_averaged(), 2);
        assert_eq!(restored_ema.decay(), 0.5);
        assert!(max_diff(&restored, &model) < 1e-6);
        assert!(max_diff(restored_ema.model(), ema.model()) < 1e-6);

        // momentum buffers came back: the next step matches the uninterrupted run
        let continued = sgd_step(model, &mut optim, images.clone());
        let resumed = sgd_step(restored, &mut restored_optim, images);
        assert!(max_diff(&resumed, &continued) < 1e-5);
    }

    #[test]
    fn test_missing_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<ResNetRecord<TestBackend>, _> =
            load_record::<TestBackend, _>(&dir.path().join("nothing"), &test_device());
        assert!(matches!(result, Err(CheckpointError::Record(..))));
    }
}
