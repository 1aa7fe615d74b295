//! Architecture presets, block kinds and dtype selection.

use serde::{Deserialize, Serialize};

/// Residual block flavour used by a ResNet stage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Two 3x3 convolutions.
    Basic,
    /// 1x1 reduce, 3x3, 1x1 expand.
    Bottleneck,
}

impl BlockKind {
    /// Ratio between a block's output channels and its nominal stage width.
    #[must_use]
    pub fn expansion(self) -> usize {
        match self {
            Self::Basic => 1,
            Self::Bottleneck => 4,
        }
    }
}

/// ResNet depth presets.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
    Resnet152,
}

impl Arch {
    pub const ALL: [Arch; 5] = [
        Self::Resnet18,
        Self::Resnet34,
        Self::Resnet50,
        Self::Resnet101,
        Self::Resnet152,
    ];

    /// Number of residual blocks in each of the four stages.
    #[must_use]
    pub fn layers(self) -> [usize; 4] {
        match self {
            Self::Resnet18 => [2, 2, 2, 2],
            Self::Resnet34 | Self::Resnet50 => [3, 4, 6, 3],
            Self::Resnet101 => [3, 4, 23, 3],
            Self::Resnet152 => [3, 8, 36, 3],
        }
    }

    #[must_use]
    pub fn block(self) -> BlockKind {
        match self {
            Self::Resnet18 | Self::Resnet34 => BlockKind::Basic,
            Self::Resnet50 | Self::Resnet101 | Self::Resnet152 => BlockKind::Bottleneck,
        }
    }

    /// Width of the features entering the classifier.
    #[must_use]
    pub fn feature_dim(self) -> usize {
        512 * self.block().expansion()
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resnet18 => write!(f, "resnet18"),
            Self::Resnet34 => write!(f, "resnet34"),
            Self::Resnet50 => write!(f, "resnet50"),
            Self::Resnet101 => write!(f, "resnet101"),
            Self::Resnet152 => write!(f, "resnet152"),
        }
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "resnet18" | "18" => Ok(Self::Resnet18),
            "resnet34" | "34" => Ok(Self::Resnet34),
            "resnet50" | "50" => Ok(Self::Resnet50),
            "resnet101" | "101" => Ok(Self::Resnet101),
            "resnet152" | "152" => Ok(Self::Resnet152),
            _ => Err(format!(
                "unknown architecture '{s}'. Use: resnet18, resnet34, resnet50, resnet101, resnet152"
            )),
        }
    }
}

/// Float precision the training backend runs in.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DType {
    /// Half precision formats need loss scaling to keep small gradients representable.
    #[must_use]
    pub fn is_half(self) -> bool {
        !matches!(self, Self::F32)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
        }
    }
}
