//! Exponential moving average of model weights.
//!
//! The averaged copy lives on the inner (non-autodiff) backend and is what
//! gets validated and checkpointed alongside the live model.

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, Param},
    prelude::Backend,
    tensor::Tensor,
};

use crate::block::SyncRunningStats;

#[derive(Debug, Clone)]
pub struct ModelEma<B: Backend, M: Module<B>> {
    model: M,
    decay: f64,
    num_averaged: u64,
    _backend: std::marker::PhantomData<B>,
}

impl<B, M> ModelEma<B, M>
where
    B: Backend,
    M: Module<B> + SyncRunningStats,
{
    /// Start averaging from `model`. The first [`update`](Self::update) overwrites
    /// the copy with the live weights, later ones blend.
    pub fn new(model: M, decay: f64) -> Self {
        Self::from_parts(model, decay, 0)
    }

    /// Rebuild from a checkpoint.
    pub fn from_parts(model: M, decay: f64, num_averaged: u64) -> Self {
        Self {
            model,
            decay,
            num_averaged,
            _backend: std::marker::PhantomData,
        }
    }

    /// `avg = (1 - decay) * avg + decay * live` over every float parameter, so
    /// `decay` is the weight of the live model.
    /// Batch-norm running statistics are copied from `live` as they are.
    pub fn update(&mut self, live: &M) {
        let mut collect = CollectParams::default();
        live.visit(&mut collect);

        let decay = if self.num_averaged == 0 {
            1.0
        } else {
            self.decay
        };
        let mut blend = BlendParams {
            live: collect.params.into_iter(),
            decay,
        };

        self.model = self.model.clone().map(&mut blend).sync_running_stats(live);
        self.num_averaged += 1;
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_averaged(&self) -> u64 {
        self.num_averaged
    }
}

/// Flattened float parameters in visiting order.
struct CollectParams<B: Backend> {
    params: Vec<Tensor<B, 1>>,
}

impl<B: Backend> Default for CollectParams<B> {
    fn default() -> Self {
        Self { params: Vec::new() }
    }
}

impl<B: Backend> ModuleVisitor<B> for CollectParams<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.params.push(param.val().reshape([-1]));
    }
}

struct BlendParams<B: Backend> {
    live: std::vec::IntoIter<Tensor<B, 1>>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for BlendParams<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(live) = self.live.next() else {
            return param;
        };
        let decay = self.decay;

        param.map(|avg| {
            let live = live.reshape(avg.dims());
            if decay >= 1.0 {
                live
            } else {
                avg.mul_scalar(1.0 - decay) + live.mul_scalar(decay)
            }
        })
    }
}
