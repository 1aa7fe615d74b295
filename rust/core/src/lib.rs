#![warn(clippy::pedantic)]
#![allow(
    clippy::too_many_arguments,
    clippy::similar_names,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::default_trait_access,
    //
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    //
    clippy::too_many_lines,
    clippy::type_complexity,
)]

//! ResNet Core
//!
//! This crate provides:
//! - `ResNetConfig` - architecture selection and model construction
//! - `ResNet` - the network, built from `BasicBlock` or `Bottleneck` stages
//! - `ModelEma` - exponential moving average of the weights
//! - Backend aliases selected by cargo feature

pub mod block;
pub mod config;
pub mod ema;
pub mod resnet;
#[cfg(any(test, feature = "ndarray"))]
pub mod test_utils;

pub use block::{BasicBlock, Bottleneck, Downsample, ResidualBlock, SyncRunningStats};
pub use config::{ComputeBackend, ResNetConfig, TrainingBackend, bf16, f16};
pub use ema::ModelEma;
pub use resnet::{ResNet, resnet18, resnet34, resnet50, resnet101, resnet152};
pub use resnet_config::{Arch, BlockKind, DType, ModelParams};
