use std::f64::consts::PI;

use burn::{lr_scheduler::LrScheduler, prelude::Backend};
use resnet_config::TrainConfig;

/// Cosine annealing with warm restarts, stepped once per epoch.
///
/// Within a cycle of `t_i` epochs the rate follows
/// `eta_min + (base - eta_min) * (1 + cos(pi * t_cur / t_i)) / 2`.
/// Each restart jumps back to `base` and multiplies the cycle length by `t_mult`.
#[derive(Clone, Debug)]
pub struct CosineAnnealingWarmRestarts {
    base_lr: f64,
    t_0: usize,
    t_mult: usize,
    eta_min: f64,
    step: usize,
}

impl CosineAnnealingWarmRestarts {
    #[must_use]
    pub fn new(base_lr: f64, t_0: usize, t_mult: usize, eta_min: f64) -> Self {
        Self {
            base_lr,
            t_0: t_0.max(1),
            t_mult: t_mult.max(1),
            eta_min,
            step: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(
            config.lr,
            config.restart_period(),
            config.lr_t_mult,
            config.lr_eta_min,
        )
    }

    /// Continue from a checkpoint after `step` scheduler steps.
    #[must_use]
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Position inside the current cycle and the cycle length.
    fn cycle_position(&self, epoch: usize) -> (usize, usize) {
        let mut t_cur = epoch;
        let mut t_i = self.t_0;
        while t_cur >= t_i {
            t_cur -= t_i;
            t_i *= self.t_mult;
        }
        (t_cur, t_i)
    }

    /// Learning rate used during `epoch` (0-based).
    #[must_use]
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let (t_cur, t_i) = self.cycle_position(epoch);
        let progress = t_cur as f64 / t_i as f64;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }

    /// Rate for the epoch about to run, without advancing.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }
}

impl LrScheduler for CosineAnnealingWarmRestarts {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> f64 {
        let lr = self.current_lr();
        self.step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.step
    }

    fn load_record<B: Backend>(self, record: Self::Record<B>) -> Self {
        self.with_step(record)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_epoch_uses_base_lr() {
        let mut sched = CosineAnnealingWarmRestarts::new(0.1, 4, 1, 0.0);
        assert!(close(sched.step(), 0.1));
        assert_eq!(sched.step_count(), 1);
    }

    #[test]
    fn test_half_cycle() {
        let sched = CosineAnnealingWarmRestarts::new(0.1, 4, 1, 0.0);
        assert!(close(sched.lr_at(2), 0.05));
    }

    #[test_case(1, &[0, 4, 8] ; "fixed period")]
    #[test_case(2, &[0, 4, 12] ; "doubling period")]
    fn test_restarts(t_mult: usize, restarts: &[usize]) {
        let sched = CosineAnnealingWarmRestarts::new(0.1, 4, t_mult, 1e-3);
        for &epoch in restarts {
            assert!(close(sched.lr_at(epoch), 0.1), "epoch {epoch}");
        }
        // one before a restart is near eta_min but above it
        let before = sched.lr_at(restarts[1] - 1);
        assert!(before > 1e-3 && before < 0.1 / 2.0);
    }

    #[test]
    fn test_monotone_within_cycle() {
        let sched = CosineAnnealingWarmRestarts::new(0.1, 10, 1, 5e-5);
        let lrs: Vec<f64> = (0..10).map(|e| sched.lr_at(e)).collect();
        assert!(lrs.windows(2).all(|w| w[1] < w[0]));
        assert!(lrs.iter().all(|lr| *lr >= 5e-5));
    }

    #[test]
    fn test_record_roundtrip() {
        let mut sched = CosineAnnealingWarmRestarts::new(0.1, 3, 1, 0.0);
        sched.step();
        sched.step();
        let record = LrScheduler::to_record::<burn::backend::NdArray>(&sched);
        let restored = CosineAnnealingWarmRestarts::new(0.1, 3, 1, 0.0)
            .load_record::<burn::backend::NdArray>(record);
        assert_eq!(restored.current_lr(), sched.current_lr());
    }

    #[test]
    fn test_from_config_defaults() {
        let sched = CosineAnnealingWarmRestarts::from_config(&TrainConfig::default());
        // 600 epochs, restart every 150
        assert!(close(sched.lr_at(150), 0.1));
        assert!(close(sched.lr_at(0), 0.1));
    }
}
