//! Shared test utilities.

use burn::tensor::{Distribution, Tensor};
use resnet_config::Arch;

use crate::{config::ResNetConfig, resnet::ResNet};

pub type TestBackend = burn::backend::NdArray<f32>;
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

#[must_use]
pub fn test_device() -> burn::backend::ndarray::NdArrayDevice {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

/// Smallest network that still has every component: resnet18 with a handful of classes.
#[must_use]
pub fn tiny_config(num_classes: usize) -> ResNetConfig {
    ResNetConfig::new(Arch::Resnet18, num_classes)
}

#[must_use]
pub fn tiny_model(num_classes: usize) -> ResNet<TestBackend> {
    tiny_config(num_classes).init(&test_device())
}

/// Random images `[batch, 3, size, size]`.
#[must_use]
pub fn random_images(batch: usize, size: usize) -> Tensor<TestBackend, 4> {
    Tensor::random([batch, 3, size, size], Distribution::Default, &test_device())
}
