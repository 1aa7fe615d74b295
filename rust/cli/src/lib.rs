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

//! This is the main facade crate that re-exports commonly used items
//! from all sub-crates and provides the `resnet` binary.

pub mod artifact_info;
pub mod metrics_export;

pub use resnet_config::{Arch, DType, TrainParams};
pub use resnet_core::{ComputeBackend, ModelEma, ResNet, ResNetConfig, TrainingBackend};
pub use resnet_data::{ClassificationBatch, ImageBatcher, ImageFolder, ImageTransform, Split};
pub use resnet_training::{
    CheckpointSelector, EvalResult, Prediction, ResNetClassifier, ResNetTrainingConfig,
};

#[cfg(not(any(
    feature = "cuda",
    feature = "rocm",
    feature = "wgpu",
    feature = "cpu",
    feature = "ndarray"
)))]
compile_error!(
    "At least one backend must be enabled, please run with `--features cuda/rocm/wgpu/cpu/ndarray`"
);
