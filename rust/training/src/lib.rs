#![warn(clippy::pedantic)]
#![allow(
    clippy::too_many_arguments,
    clippy::similar_names,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::default_trait_access,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines,
    clippy::type_complexity
)]

pub mod accuracy;
pub mod checkpoint;
pub mod error;
pub mod eval;
pub mod inference;
pub mod logger;
pub mod meter;
pub mod scaler;
pub mod scheduler;
pub mod training;

pub use accuracy::accuracy;
pub use checkpoint::{
    CheckpointError, CheckpointPaths, CheckpointSelector, CheckpointState, find_latest_checkpoint,
    load_checkpoint, save_checkpoint,
};
pub use error::TrainingError;
pub use eval::{EvalResult, evaluate, validate};
pub use inference::{Prediction, ResNetClassifier, classify};
pub use logger::MetricLogger;
pub use meter::{AverageMeter, ProgressMeter, Summary};
pub use scaler::{GradScaler, ScalerState};
pub use scheduler::CosineAnnealingWarmRestarts;
pub use training::{
    EmaResNet, EpochStats, ResNetTrainingConfig, TrainSummary, build_model, define_loss,
    define_optimizer, define_scheduler, train, train_one_epoch,
};
