use burn::tensor::backend::Backend;
use resnet_config::{Arch, BlockKind, ModelParams};
use serde::{Deserialize, Serialize};

use crate::resnet::ResNet;

/// Everything needed to build a [`ResNet`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResNetConfig {
    pub arch: Arch,
    pub num_classes: usize,
    pub groups: usize,
    pub width_per_group: usize,
}

impl ResNetConfig {
    #[must_use]
    pub fn new(arch: Arch, num_classes: usize) -> Self {
        Self {
            arch,
            num_classes,
            groups: 1,
            width_per_group: 64,
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    #[must_use]
    pub fn with_width_per_group(mut self, width_per_group: usize) -> Self {
        self.width_per_group = width_per_group;
        self
    }

    #[must_use]
    pub fn layers(&self) -> [usize; 4] {
        self.arch.layers()
    }

    #[must_use]
    pub fn block(&self) -> BlockKind {
        self.arch.block()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        ResNet::new(self, device)
    }
}

impl From<&ModelParams> for ResNetConfig {
    fn from(params: &ModelParams) -> Self {
        Self::new(params.arch, params.num_classes)
            .with_groups(params.groups)
            .with_width_per_group(params.width_per_group)
    }
}

// Backend selection, highest priority first.

#[cfg(feature = "cuda")]
pub type ComputeBackend<F = f32> = burn::backend::Cuda<F>;

#[cfg(all(feature = "rocm", not(feature = "cuda")))]
pub type ComputeBackend<F = f32> = burn::backend::Rocm<F>;

#[cfg(all(feature = "wgpu", not(any(feature = "cuda", feature = "rocm"))))]
pub type ComputeBackend<F = f32> = burn::backend::Wgpu<F>;

#[cfg(all(
    feature = "cpu",
    not(any(feature = "cuda", feature = "rocm", feature = "wgpu"))
))]
pub type ComputeBackend<F = f32> = burn::backend::Cpu<F>;

#[cfg(all(
    feature = "ndarray",
    not(any(feature = "cuda", feature = "rocm", feature = "wgpu", feature = "cpu"))
))]
pub type ComputeBackend<F = f32> = burn::backend::NdArray<F>;

#[cfg(not(any(
    feature = "cuda",
    feature = "rocm",
    feature = "wgpu",
    feature = "cpu",
    feature = "ndarray"
)))]
pub type ComputeBackend<F = f32> = compile_error!(
    "One of the features 'cuda', 'rocm', 'wgpu', 'cpu' or 'ndarray' must be enabled"
);

pub type TrainingBackend<F = f32> = burn::backend::Autodiff<ComputeBackend<F>>;

pub use half::{bf16, f16};
