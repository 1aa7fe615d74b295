//! Dynamic loss scaling for half precision training.
//!
//! The loss is multiplied by `scale` before the backward pass so small
//! gradients survive in f16. Gradients are divided back before the optimizer
//! sees them. A non-finite gradient skips the step and shrinks the scale; a run
//! of `growth_interval` clean steps grows it.

use burn::{
    module::{AutodiffModule, ModuleVisitor, Param},
    optim::GradientsParams,
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use resnet_config::{ConfigError, TrainParams};
use serde::{Deserialize, Serialize};

/// Checkpointed part of a [`GradScaler`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_tracker: u32,
}

#[derive(Clone, Debug)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    growth_tracker: u32,
}

impl GradScaler {
    pub fn new(
        scale: f32,
        growth_factor: f32,
        backoff_factor: f32,
        growth_interval: u32,
    ) -> Result<Self, ConfigError> {
        if scale <= 0.0 || !scale.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "loss scale must be positive and finite, got {scale}"
            )));
        }
        if growth_factor <= 1.0 || !growth_factor.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "scaler growth factor must exceed 1, got {growth_factor}"
            )));
        }
        if backoff_factor <= 0.0 || backoff_factor >= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "scaler backoff factor must lie in (0, 1), got {backoff_factor}"
            )));
        }
        if growth_interval == 0 {
            return Err(ConfigError::Invalid(
                "scaler growth interval must be positive".into(),
            ));
        }
        Ok(Self {
            enabled: true,
            scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            growth_tracker: 0,
        })
    }

    /// A scaler that never scales, never checks and never skips.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 1,
            growth_tracker: 0,
        }
    }

    /// Enabled exactly when `params` asks for loss scaling.
    pub fn from_params(params: &TrainParams) -> Result<Self, ConfigError> {
        if !params.loss_scaling() {
            return Ok(Self::disabled());
        }
        let config = &params.train;
        Self::new(
            config.amp_init_scale,
            config.amp_growth_factor,
            config.amp_backoff_factor,
            config.amp_growth_interval,
        )
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn scale_loss<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divide every gradient of `model` by the scale.
    ///
    /// Returns the unscaled gradients and whether any of them holds a NaN or an
    /// infinity. The check is accumulated on device and read back once.
    pub fn unscale<B, M>(&self, model: &M, grads: GradientsParams) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.enabled {
            return (grads, false);
        }

        let mut visitor = UnscaleGrads::<B> {
            grads,
            inverse: 1.0 / f64::from(self.scale),
            non_finite: None,
        };
        model.visit(&mut visitor);

        let found_inf = visitor
            .non_finite
            .is_some_and(|count| count.into_scalar().elem::<i64>() > 0);
        (visitor.grads, found_inf)
    }

    /// Back off after an overflow, grow after enough clean steps.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!("gradient overflow, loss scale reduced to {}", self.scale);
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale = (self.scale * self.growth_factor).min(f32::MAX);
                self.growth_tracker = 0;
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: ScalerState) -> Self {
        if self.enabled {
            self.scale = state.scale;
            self.growth_tracker = state.growth_tracker;
        }
        self
    }
}

struct UnscaleGrads<B: AutodiffBackend> {
    grads: GradientsParams,
    inverse: f64,
    non_finite: Option<Tensor<B::InnerBackend, 1, Int>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for UnscaleGrads<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inverse);

        let bad = grad.clone().is_nan().any().int() + grad.clone().is_inf().any().int();
        self.non_finite = Some(match self.non_finite.take() {
            Some(total) => total + bad,
            None => bad,
        });

        self.grads.register::<B::InnerBackend, D>(param.id, grad);
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::Autodiff,
        nn::{Linear, LinearConfig},
    };
    use resnet_config::DType;
    use resnet_core::test_utils::{TestBackend, test_device};

    use super::*;

    type B = Autodiff<TestBackend>;

    fn scaler() -> GradScaler {
        GradScaler::new(1024.0, 2.0, 0.5, 3).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_factors() {
        assert!(GradScaler::new(0.0, 2.0, 0.5, 1).is_err());
        assert!(GradScaler::new(1.0, 1.0, 0.5, 1).is_err());
        assert!(GradScaler::new(1.0, 2.0, 1.0, 1).is_err());
        assert!(GradScaler::new(1.0, 2.0, 0.5, 0).is_err());
    }

    #[test]
    fn test_backoff_and_growth() {
        let mut scaler = scaler();
        scaler.update(true);
        assert_eq!(scaler.scale(), 512.0);

        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 1024.0);
        assert_eq!(scaler.state().growth_tracker, 0);

        // an overflow resets the clean-step count
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 512.0);
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut scaler = GradScaler::disabled();
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
        assert!(!scaler.is_enabled());

        assert!(!GradScaler::from_params(&TrainParams::default()).unwrap().is_enabled());

        let mut params = TrainParams {
            dtype: DType::F16,
            ..Default::default()
        };
        params.train.amp = Some(false);
        assert!(!GradScaler::from_params(&params).unwrap().is_enabled());
    }

    #[test]
    fn test_half_dtype_enables_scaling() {
        let params = TrainParams {
            dtype: DType::BF16,
            ..Default::default()
        };
        let scaler = GradScaler::from_params(&params).unwrap();
        assert!(scaler.is_enabled());
        assert_eq!(scaler.scale(), params.train.amp_init_scale);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut scaler = scaler();
        scaler.update(false);
        let state = scaler.state();
        let restored = GradScaler::from_params(&TrainParams {
            dtype: DType::F16,
            ..Default::default()
        })
        .unwrap()
        .with_state(state);
        assert_eq!(restored.state(), state);
    }

    fn linear_grads(scale: f32, input: f32) -> (Linear<B>, GradientsParams) {
        let device = test_device();
        let model: Linear<B> = LinearConfig::new(2, 1).init(&device);
        let x = Tensor::<B, 2>::from_floats([[input, input]], &device);
        let loss = model.forward(x).sum().mul_scalar(scale);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        (model, grads)
    }

    #[test]
    fn test_unscale_divides_gradients() {
        let scaler = scaler();
        let (model, grads) = linear_grads(1024.0, 1.0);

        let (mut grads, found_inf) = scaler.unscale(&model, grads);
        assert!(!found_inf);

        let bias = model.bias.as_ref().unwrap();
        let grad = grads.remove::<TestBackend, 1>(bias.id).unwrap();
        grad.into_data()
            .assert_approx_eq::<f32>(&TensorData::from([1.0f32]), Default::default());
    }

    #[test]
    fn test_unscale_detects_overflow() {
        let scaler = scaler();
        let (model, grads) = linear_grads(1024.0, f32::INFINITY);

        let (_, found_inf) = scaler.unscale(&model, grads);
        assert!(found_inf);
    }
}
