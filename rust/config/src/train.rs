//! Model, training and data configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Arch, DType};

/// Network shape.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ModelParams {
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "resnet18"))]
    pub arch: Arch,
    #[serde(default = "default_num_classes")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "1000"))]
    pub num_classes: usize,
    /// Convolution groups in the bottleneck 3x3 (ResNeXt style).
    #[serde(default = "default_groups")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "1", hide = true))]
    pub groups: usize,
    #[serde(default = "default_width_per_group")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "64", hide = true))]
    pub width_per_group: usize,
}

fn default_num_classes() -> usize {
    1000
}
fn default_groups() -> usize {
    1
}
fn default_width_per_group() -> usize {
    64
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            arch: Arch::default(),
            num_classes: default_num_classes(),
            groups: default_groups(),
            width_per_group: default_width_per_group(),
        }
    }
}

impl ModelParams {
    #[must_use]
    pub fn new(arch: Arch, num_classes: usize) -> Self {
        Self {
            arch,
            num_classes,
            ..Default::default()
        }
    }
}

/// Training hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct TrainConfig {
    #[serde(default = "default_batch")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "128"))]
    pub batch: usize,
    #[serde(default = "default_epochs")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "600"))]
    pub epochs: usize,
    #[serde(default = "default_lr")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0.1"))]
    pub lr: f64,
    #[serde(default = "default_momentum")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0.9"))]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "2e-5"))]
    pub weight_decay: f32,
    #[serde(default = "default_label_smoothing")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0.1"))]
    pub label_smoothing: f32,
    /// Multiplier applied to the criterion output.
    #[serde(default = "default_loss_weight")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "1.0", hide = true))]
    pub loss_weight: f64,
    /// Weight of the live model in each averaging step.
    #[serde(default = "default_ema_decay")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0.99998"))]
    pub ema_decay: f64,
    /// Epochs until the first warm restart. Defaults to a quarter of `epochs`.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub lr_t0: Option<usize>,
    #[serde(default = "default_lr_t_mult")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "1"))]
    pub lr_t_mult: usize,
    #[serde(default = "default_lr_eta_min")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "5e-5"))]
    pub lr_eta_min: f64,
    #[serde(default = "default_workers")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "4"))]
    pub workers: usize,
    #[serde(default = "default_train_print_frequency")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "200"))]
    pub train_print_frequency: usize,
    #[serde(default = "default_valid_print_frequency")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "20"))]
    pub valid_print_frequency: usize,
    /// Dynamic loss scaling. Follows `dtype` when unset and needs a half dtype when on.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, action = clap::ArgAction::Set))]
    pub amp: Option<bool>,
    #[serde(default = "default_amp_init_scale")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "65536", hide = true))]
    pub amp_init_scale: f32,
    #[serde(default = "default_amp_growth_factor")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "2.0", hide = true))]
    pub amp_growth_factor: f32,
    #[serde(default = "default_amp_backoff_factor")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "0.5", hide = true))]
    pub amp_backoff_factor: f32,
    #[serde(default = "default_amp_growth_interval")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "2000", hide = true))]
    pub amp_growth_interval: u32,
}

fn default_batch() -> usize {
    128
}
fn default_epochs() -> usize {
    600
}
fn default_lr() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f32 {
    2e-5
}
fn default_label_smoothing() -> f32 {
    0.1
}
fn default_loss_weight() -> f64 {
    1.0
}
fn default_ema_decay() -> f64 {
    0.99998
}
fn default_lr_t_mult() -> usize {
    1
}
fn default_lr_eta_min() -> f64 {
    5e-5
}
fn default_workers() -> usize {
    4
}
fn default_train_print_frequency() -> usize {
    200
}
fn default_valid_print_frequency() -> usize {
    20
}
fn default_amp_init_scale() -> f32 {
    65536.0
}
fn default_amp_growth_factor() -> f32 {
    2.0
}
fn default_amp_backoff_factor() -> f32 {
    0.5
}
fn default_amp_growth_interval() -> u32 {
    2000
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch: default_batch(),
            epochs: default_epochs(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            label_smoothing: default_label_smoothing(),
            loss_weight: default_loss_weight(),
            ema_decay: default_ema_decay(),
            lr_t0: None,
            lr_t_mult: default_lr_t_mult(),
            lr_eta_min: default_lr_eta_min(),
            workers: default_workers(),
            train_print_frequency: default_train_print_frequency(),
            valid_print_frequency: default_valid_print_frequency(),
            amp: None,
            amp_init_scale: default_amp_init_scale(),
            amp_growth_factor: default_amp_growth_factor(),
            amp_backoff_factor: default_amp_backoff_factor(),
            amp_growth_interval: default_amp_growth_interval(),
        }
    }
}

impl TrainConfig {
    /// Epochs in the first cosine cycle.
    #[must_use]
    pub fn restart_period(&self) -> usize {
        self.lr_t0.unwrap_or(self.epochs / 4).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch == 0 {
            return Err(ConfigError::Invalid("batch must be positive".into()));
        }
        if self.epochs == 0 {
            return Err(ConfigError::Invalid("epochs must be positive".into()));
        }
        if self.lr_t_mult == 0 {
            return Err(ConfigError::Invalid("lr_t_mult must be at least 1".into()));
        }
        if self.lr_t0 == Some(0) {
            return Err(ConfigError::Invalid("lr_t0 must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(ConfigError::Invalid(format!(
                "ema_decay must lie in [0, 1], got {}",
                self.ema_decay
            )));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(ConfigError::Invalid(format!(
                "label_smoothing must lie in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if self.train_print_frequency == 0 || self.valid_print_frequency == 0 {
            return Err(ConfigError::Invalid(
                "print frequencies must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Dataset locations and preprocessing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct DataConfig {
    #[serde(default = "default_train_dir")]
    #[cfg_attr(
        feature = "clap",
        arg(long, default_value = "./data/ImageNet_1K/ILSVRC2012_img_train")
    )]
    pub train_dir: String,
    #[serde(default = "default_valid_dir")]
    #[cfg_attr(
        feature = "clap",
        arg(long, default_value = "./data/ImageNet_1K/ILSVRC2012_img_val")
    )]
    pub valid_dir: String,
    #[serde(default = "default_image_size")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "224"))]
    pub image_size: usize,
    /// Shorter side after resizing, before the validation center crop.
    #[serde(default = "default_resize_size")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "256"))]
    pub resize_size: usize,
    #[serde(default = "default_mean")]
    #[cfg_attr(
        feature = "clap",
        arg(long, value_delimiter = ',', default_values_t = default_mean())
    )]
    pub mean: Vec<f32>,
    #[serde(default = "default_std")]
    #[cfg_attr(
        feature = "clap",
        arg(long, value_delimiter = ',', default_values_t = default_std())
    )]
    pub std: Vec<f32>,
}

fn default_train_dir() -> String {
    "./data/ImageNet_1K/ILSVRC2012_img_train".into()
}
fn default_valid_dir() -> String {
    "./data/ImageNet_1K/ILSVRC2012_img_val".into()
}
fn default_image_size() -> usize {
    224
}
fn default_resize_size() -> usize {
    256
}
fn default_mean() -> Vec<f32> {
    vec![0.485, 0.456, 0.406]
}
fn default_std() -> Vec<f32> {
    vec![0.229, 0.224, 0.225]
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_dir: default_train_dir(),
            valid_dir: default_valid_dir(),
            image_size: default_image_size(),
            resize_size: default_resize_size(),
            mean: default_mean(),
            std: default_std(),
        }
    }
}

impl DataConfig {
    /// Per-channel mean and std as fixed arrays.
    pub fn normalization(&self) -> Result<([f32; 3], [f32; 3]), ConfigError> {
        let mean: [f32; 3] = self.mean.as_slice().try_into().map_err(|_| {
            ConfigError::Invalid(format!("mean needs 3 values, got {}", self.mean.len()))
        })?;
        let std: [f32; 3] = self.std.as_slice().try_into().map_err(|_| {
            ConfigError::Invalid(format!("std needs 3 values, got {}", self.std.len()))
        })?;
        if std.iter().any(|s| *s <= 0.0) {
            return Err(ConfigError::Invalid("std values must be positive".into()));
        }
        Ok((mean, std))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size == 0 || self.resize_size == 0 {
            return Err(ConfigError::Invalid("image sizes must be positive".into()));
        }
        self.normalization().map(|_| ())
    }
}

/// Full training parameters, as given on the command line or in an experiment file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct TrainParams {
    #[serde(default, flatten)]
    #[cfg_attr(feature = "clap", command(flatten))]
    pub model: ModelParams,
    #[serde(default, flatten)]
    #[cfg_attr(feature = "clap", command(flatten))]
    pub train: TrainConfig,
    #[serde(default, flatten)]
    #[cfg_attr(feature = "clap", command(flatten))]
    pub data: DataConfig,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "f32"))]
    pub dtype: DType,
    /// Model record to initialize the weights from.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub pretrained: Option<String>,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub seed: Option<u64>,
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub dry_run: bool,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            model: ModelParams::default(),
            train: TrainConfig::default(),
            data: DataConfig::default(),
            dtype: DType::default(),
            pretrained: None,
            seed: None,
            dry_run: false,
        }
    }
}

impl TrainParams {
    /// Load an experiment file. Missing keys take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply every value of `cli` that differs from the built-in default on top of `self`.
    ///
    /// This lets an experiment file set the baseline while explicit flags still win.
    pub fn overlay(self, cli: &TrainParams) -> Result<Self, ConfigError> {
        let defaults = to_value(&TrainParams::default())?;
        let cli = to_value(cli)?;
        let base = to_value(&self)?;

        let overrides = match (cli, defaults) {
            (Value::Object(cli), Value::Object(defaults)) => Value::Object(
                cli.into_iter()
                    .filter(|(k, v)| defaults.get(k) != Some(v))
                    .collect(),
            ),
            (cli, _) => cli,
        };

        serde_json::from_value(merge_json(base, overrides))
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.num_classes == 0 {
            return Err(ConfigError::Invalid("num_classes must be positive".into()));
        }
        if self.model.groups == 0 || self.model.width_per_group == 0 {
            return Err(ConfigError::Invalid(
                "groups and width_per_group must be positive".into(),
            ));
        }
        if self.train.amp == Some(true) && !self.dtype.is_half() {
            return Err(ConfigError::Invalid(format!(
                "amp scales half precision losses, but dtype is {}",
                self.dtype
            )));
        }
        self.train.validate()?;
        self.data.validate()
    }

    /// Whether training runs with dynamic loss scaling.
    #[must_use]
    pub fn loss_scaling(&self) -> bool {
        self.train.amp.unwrap_or(self.dtype.is_half())
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ConfigError> {
    serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Recursively merge two JSON values. `overlay` values override `base`.
#[must_use]
pub fn merge_json(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                let merged = if let Some(base_v) = base_map.remove(&k) {
                    merge_json(base_v, v)
                } else {
                    v
                };
                base_map.insert(k, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
