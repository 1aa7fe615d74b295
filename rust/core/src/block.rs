//! Residual blocks.
//!
//! burn's `Module` is not object safe, so the two block flavours are wrapped in
//! [`ResidualBlock`] and a stage is a plain `Vec` of it.

use burn::{
    module::{Module, RunningState},
    nn::{
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::Backend,
    tensor::{Tensor, activation::relu},
};
use resnet_config::BlockKind;

/// Kaiming normal in fan-out mode with the ReLU gain.
///
/// Fan-out counts every output channel regardless of `groups`, which burn's
/// `KaimingNormal` divides out.
#[must_use]
pub fn conv_initializer(out_channels: usize, kernel: usize) -> Initializer {
    Initializer::Normal {
        mean: 0.0,
        std: (2.0 / (out_channels * kernel * kernel) as f64).sqrt(),
    }
}

/// Bias-free 2d convolution with the network's weight init.
pub fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    groups: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_groups(groups)
        .with_bias(false)
        .with_initializer(conv_initializer(channels[1], kernel))
        .init(device)
}

/// Batch norm with weight 1 and bias 0.
pub fn batch_norm<B: Backend>(num_features: usize, device: &B::Device) -> BatchNorm<B> {
    BatchNormConfig::new(num_features).init(device)
}

/// Copies running statistics from another instance of the same module.
///
/// Parameters are handled by [`crate::ema::ModelEma`]; batch-norm buffers are
/// not parameters, so structures that hold them implement this explicitly.
pub trait SyncRunningStats {
    #[must_use]
    fn sync_running_stats(self, source: &Self) -> Self;
}

impl<B: Backend> SyncRunningStats for BatchNorm<B> {
    fn sync_running_stats(mut self, source: &Self) -> Self {
        self.running_mean = RunningState::new(source.running_mean.value());
        self.running_var = RunningState::new(source.running_var.value());
        self
    }
}

/// 1x1 projection applied to the shortcut when shape changes.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv([in_channels, out_channels], 1, stride, 0, 1, device),
            bn: batch_norm(out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

impl<B: Backend> SyncRunningStats for Downsample<B> {
    fn sync_running_stats(mut self, source: &Self) -> Self {
        self.bn = self.bn.sync_running_stats(&source.bn);
        self
    }
}

/// Two 3x3 convolutions with an identity shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub downsample: Option<Downsample<B>>,
    pub stride: usize,
}

impl<B: Backend> BasicBlock<B> {
    pub const EXPANSION: usize = 1;

    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
        device: &B::Device,
    ) -> Self {
        Self {
            conv1: conv([in_channels, out_channels], 3, stride, 1, 1, device),
            bn1: batch_norm(out_channels, device),
            conv2: conv([out_channels, out_channels], 3, 1, 1, 1, device),
            bn2: batch_norm(out_channels, device),
            downsample,
            stride,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));

        relu(out + identity)
    }
}

impl<B: Backend> SyncRunningStats for BasicBlock<B> {
    fn sync_running_stats(mut self, source: &Self) -> Self {
        self.bn1 = self.bn1.sync_running_stats(&source.bn1);
        self.bn2 = self.bn2.sync_running_stats(&source.bn2);
        self.downsample = sync_optional(self.downsample, source.downsample.as_ref());
        self
    }
}

/// 1x1 reduce, grouped 3x3, 1x1 expand (x4) with a shortcut.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B>,
    pub downsample: Option<Downsample<B>>,
    pub stride: usize,
}

impl<B: Backend> Bottleneck<B> {
    pub const EXPANSION: usize = 4;

    /// Width of the inner 3x3 convolution.
    #[must_use]
    pub fn inner_channels(out_channels: usize, width_per_group: usize, groups: usize) -> usize {
        out_channels * width_per_group / 64 * groups
    }

    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
        groups: usize,
        width_per_group: usize,
        device: &B::Device,
    ) -> Self {
        let channels = Self::inner_channels(out_channels, width_per_group, groups);
        let expanded = out_channels * Self::EXPANSION;

        Self {
            conv1: conv([in_channels, channels], 1, 1, 0, 1, device),
            bn1: batch_norm(channels, device),
            conv2: conv([channels, channels], 3, stride, 1, groups, device),
            bn2: batch_norm(channels, device),
            conv3: conv([channels, expanded], 1, 1, 0, 1, device),
            bn3: batch_norm(expanded, device),
            downsample,
            stride,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        relu(out + identity)
    }
}

impl<B: Backend> SyncRunningStats for Bottleneck<B> {
    fn sync_running_stats(mut self, source: &Self) -> Self {
        self.bn1 = self.bn1.sync_running_stats(&source.bn1);
        self.bn2 = self.bn2.sync_running_stats(&source.bn2);
        self.bn3 = self.bn3.sync_running_stats(&source.bn3);
        self.downsample = sync_optional(self.downsample, source.downsample.as_ref());
        self
    }
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        kind: BlockKind,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
        groups: usize,
        width_per_group: usize,
        device: &B::Device,
    ) -> Self {
        match kind {
            BlockKind::Basic => Self::Basic(BasicBlock::new(
                in_channels,
                out_channels,
                stride,
                downsample,
                device,
            )),
            BlockKind::Bottleneck => Self::Bottleneck(Bottleneck::new(
                in_channels,
                out_channels,
                stride,
                downsample,
                groups,
                width_per_group,
                device,
            )),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(x),
            Self::Bottleneck(block) => block.forward(x),
        }
    }

    pub fn has_downsample(&self) -> bool {
        match self {
            Self::Basic(block) => block.downsample.is_some(),
            Self::Bottleneck(block) => block.downsample.is_some(),
        }
    }
}

impl<B: Backend> SyncRunningStats for ResidualBlock<B> {
    fn sync_running_stats(self, source: &Self) -> Self {
        match (self, source) {
            (Self::Basic(block), Self::Basic(src)) => Self::Basic(block.sync_running_stats(src)),
            (Self::Bottleneck(block), Self::Bottleneck(src)) => {
                Self::Bottleneck(block.sync_running_stats(src))
            }
            (block, _) => block,
        }
    }
}

fn sync_optional<M: SyncRunningStats>(target: Option<M>, source: Option<&M>) -> Option<M> {
    match (target, source) {
        (Some(target), Some(source)) => Some(target.sync_running_stats(source)),
        (target, _) => target,
    }
}

/// Builds one stage: the first block may stride and project, the rest keep shape.
///
/// Returns the blocks and the channel count leaving the stage.
pub fn make_stage<B: Backend>(
    kind: BlockKind,
    in_channels: usize,
    channels: usize,
    blocks: usize,
    stride: usize,
    groups: usize,
    width_per_group: usize,
    device: &B::Device,
) -> (Vec<ResidualBlock<B>>, usize) {
    let out_channels = channels * kind.expansion();

    let downsample = (stride != 1 || in_channels != out_channels)
        .then(|| Downsample::new(in_channels, out_channels, stride, device));

    let mut layers = Vec::with_capacity(blocks);
    layers.push(ResidualBlock::new(
        kind,
        in_channels,
        channels,
        stride,
        downsample,
        groups,
        width_per_group,
        device,
    ));
    for _ in 1..blocks {
        layers.push(ResidualBlock::new(
            kind,
            out_channels,
            channels,
            1,
            None,
            groups,
            width_per_group,
            device,
        ));
    }

    (layers, out_channels)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::test_utils::{TestBackend, test_device};

    #[test_case([64, 256], 1 ; "ungrouped")]
    #[test_case([256, 256], 32 ; "grouped")]
    fn test_conv_weight_std_ignores_groups(channels: [usize; 2], groups: usize) {
        let conv = conv::<TestBackend>(channels, 3, 1, 1, groups, &test_device());
        let weights = conv.weight.val().into_data().to_vec::<f32>().unwrap();

        let n = weights.len() as f64;
        let mean = weights.iter().map(|w| f64::from(*w)).sum::<f64>() / n;
        let var = weights
            .iter()
            .map(|w| (f64::from(*w) - mean).powi(2))
            .sum::<f64>()
            / n;
        let expected = (2.0_f64 / (256.0 * 9.0)).sqrt();
        assert!(
            (var.sqrt() - expected).abs() < expected * 0.05,
            "std {} vs {expected}",
            var.sqrt()
        );
    }
}
