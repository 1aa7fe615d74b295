use burn::{
    module::Module,
    nn::{
        BatchNorm, Linear, LinearConfig, PaddingConfig2d,
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    prelude::Backend,
    tensor::{Tensor, activation::relu},
};
use resnet_config::Arch;

use crate::{
    block::{ResidualBlock, SyncRunningStats, batch_norm, conv, make_stage},
    config::ResNetConfig,
};

/// Channels leaving the stem.
pub const STEM_CHANNELS: usize = 64;
/// Base channel count of each stage.
pub const STAGE_CHANNELS: [usize; 4] = [64, 128, 256, 512];
/// Stride of the first block in each stage.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub maxpool: MaxPool2d,
    pub layer1: Vec<ResidualBlock<B>>,
    pub layer2: Vec<ResidualBlock<B>>,
    pub layer3: Vec<ResidualBlock<B>>,
    pub layer4: Vec<ResidualBlock<B>>,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn new(config: &ResNetConfig, device: &B::Device) -> Self {
        let kind = config.block();
        let layers = config.layers();

        let mut in_channels = STEM_CHANNELS;
        let mut stages: Vec<Vec<ResidualBlock<B>>> = Vec::with_capacity(4);
        for ((blocks, channels), stride) in layers.iter().zip(STAGE_CHANNELS).zip(STAGE_STRIDES) {
            let (stage, out_channels) = make_stage(
                kind,
                in_channels,
                channels,
                *blocks,
                stride,
                config.groups,
                config.width_per_group,
                device,
            );
            stages.push(stage);
            in_channels = out_channels;
        }

        let mut stages = stages.into_iter();
        let mut next_stage = || stages.next().unwrap_or_default();
        let (layer1, layer2, layer3, layer4) = (next_stage(), next_stage(), next_stage(), next_stage());

        tracing::debug!(
            arch = %config.arch,
            num_classes = config.num_classes,
            feature_dim = in_channels,
            "building resnet"
        );

        Self {
            conv1: conv([3, STEM_CHANNELS], 7, 2, 3, 1, device),
            bn1: batch_norm(STEM_CHANNELS, device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, config.num_classes).init(device),
        }
    }

    /// Pooled feature vector before the classifier, `[batch, feature_dim]`.
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = relu(self.bn1.forward(x));
        let mut x = self.maxpool.forward(x);

        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }

        self.avgpool.forward(x).flatten(1, 3)
    }

    /// Class logits `[batch, num_classes]` for images `[batch, 3, height, width]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.features(images))
    }

    /// Blocks per stage, in order.
    pub fn stages(&self) -> [&[ResidualBlock<B>]; 4] {
        [&self.layer1, &self.layer2, &self.layer3, &self.layer4]
    }

    pub fn num_classes(&self) -> usize {
        self.fc.weight.dims()[1]
    }

    pub fn feature_dim(&self) -> usize {
        self.fc.weight.dims()[0]
    }
}

impl<B: Backend> SyncRunningStats for ResNet<B> {
    fn sync_running_stats(mut self, source: &Self) -> Self {
        fn sync_stage<B: Backend>(
            target: Vec<ResidualBlock<B>>,
            source: &[ResidualBlock<B>],
        ) -> Vec<ResidualBlock<B>> {
            target
                .into_iter()
                .zip(source)
                .map(|(block, src)| block.sync_running_stats(src))
                .collect()
        }

        self.bn1 = self.bn1.sync_running_stats(&source.bn1);
        self.layer1 = sync_stage(self.layer1, &source.layer1);
        self.layer2 = sync_stage(self.layer2, &source.layer2);
        self.layer3 = sync_stage(self.layer3, &source.layer3);
        self.layer4 = sync_stage(self.layer4, &source.layer4);
        self
    }
}

pub fn resnet18<B: Backend>(num_classes: usize, device: &B::Device) -> ResNet<B> {
    ResNetConfig::new(Arch::Resnet18, num_classes).init(device)
}

pub fn resnet34<B: Backend>(num_classes: usize, device: &B::Device) -> ResNet<B> {
    ResNetConfig::new(Arch::Resnet34, num_classes).init(device)
}

pub fn resnet50<B: Backend>(num_classes: usize, device: &B::Device) -> ResNet<B> {
    ResNetConfig::new(Arch::Resnet50, num_classes).init(device)
}

pub fn resnet101<B: Backend>(num_classes: usize, device: &B::Device) -> ResNet<B> {
    ResNetConfig::new(Arch::Resnet101, num_classes).init(device)
}

pub fn resnet152<B: Backend>(num_classes: usize, device: &B::Device) -> ResNet<B> {
    ResNetConfig::new(Arch::Resnet152, num_classes).init(device)
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;
    use test_case::test_case;

    use super::*;
    use crate::{
        block::Bottleneck,
        test_utils::{TestBackend, test_device},
    };

    #[test]
    fn test_resnet18_output_shape() {
        let device = test_device();
        let model = resnet18::<TestBackend>(10, &device);
        let images = Tensor::<TestBackend, 4>::random([2, 3, 64, 64], Distribution::Default, &device);

        let logits = model.forward(images);
        assert_eq!(logits.dims(), [2, 10]);
        assert_eq!(model.num_classes(), 10);
        assert_eq!(model.feature_dim(), 512);
    }

    #[test]
    fn test_bottleneck_output_shape() {
        let device = test_device();
        let model = resnet50::<TestBackend>(7, &device);
        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);

        assert_eq!(model.features(images.clone()).dims(), [1, 2048]);
        assert_eq!(model.forward(images).dims(), [1, 7]);
    }

    #[test_case(Arch::Resnet18, [2, 2, 2, 2] ; "resnet18")]
    #[test_case(Arch::Resnet34, [3, 4, 6, 3] ; "resnet34")]
    #[test_case(Arch::Resnet50, [3, 4, 6, 3] ; "resnet50")]
    fn test_stage_depths(arch: Arch, depths: [usize; 4]) {
        let device = test_device();
        let model = ResNetConfig::new(arch, 4).init::<TestBackend>(&device);
        let actual = model.stages().map(<[_]>::len);
        assert_eq!(actual, depths);
    }

    #[test]
    fn test_downsample_only_where_shape_changes() {
        let device = test_device();

        // Basic blocks: stage 1 keeps 64 channels at stride 1.
        let model = resnet18::<TestBackend>(4, &device);
        let firsts = model.stages().map(|stage| stage[0].has_downsample());
        assert_eq!(firsts, [false, true, true, true]);
        assert!(model.stages().iter().all(|s| s[1..].iter().all(|b| !b.has_downsample())));

        // Bottleneck: stage 1 expands 64 -> 256, so it projects too.
        let model = resnet50::<TestBackend>(4, &device);
        let firsts = model.stages().map(|stage| stage[0].has_downsample());
        assert_eq!(firsts, [true, true, true, true]);
    }

    #[test]
    fn test_bottleneck_inner_width() {
        assert_eq!(Bottleneck::<TestBackend>::inner_channels(64, 64, 1), 64);
        assert_eq!(Bottleneck::<TestBackend>::inner_channels(256, 64, 1), 256);
        // resnext50_32x4d
        assert_eq!(Bottleneck::<TestBackend>::inner_channels(64, 4, 32), 128);
        // wide_resnet50_2
        assert_eq!(Bottleneck::<TestBackend>::inner_channels(128, 128, 1), 256);
    }

    #[test]
    fn test_grouped_bottleneck_forward() {
        let device = test_device();
        let model = ResNetConfig::new(Arch::Resnet50, 3)
            .with_groups(4)
            .with_width_per_group(16)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);

        assert_eq!(model.forward(images).dims(), [1, 3]);
    }

    #[test]
    fn test_sync_running_stats_copies_buffers() {
        let device = test_device();
        let source = resnet18::<TestBackend>(4, &device);
        let mut source_bn = source.bn1.clone();
        source_bn.running_mean = burn::module::RunningState::new(Tensor::ones([64], &device));
        let source = ResNet { bn1: source_bn, ..source };

        let target = resnet18::<TestBackend>(4, &device).sync_running_stats(&source);
        let mean = target.bn1.running_mean.value().into_data();
        mean.assert_eq(&Tensor::<TestBackend, 1>::ones([64], &device).into_data(), true);
    }
}
