//! Gradient accumulation over a fixed set of parameters.
//!
//! Buffers are flattened per parameter and start at zero. `apply` hands the
//! summed gradients to an optimizer step and then zeroes the buffers; there is
//! no other way to reset them.

use burn::module::ParamId;
use burn::optim::GradientsParams;
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use tracing::debug;

use crate::model::ParamSlot;

pub const DEFAULT_ACCUMULATION_STEPS: usize = 4;

pub struct GradientAccumulator<B: Backend> {
    slots: Vec<ParamSlot>,
    buffers: Vec<Tensor<B, 1>>,
    period: usize,
    accumulated: usize,
}

impl<B: Backend> GradientAccumulator<B> {
    pub fn new(slots: Vec<ParamSlot>, period: usize, device: &B::Device) -> Self {
        let buffers = slots
            .iter()
            .map(|slot| Tensor::zeros([slot.num_elements()], device))
            .collect();
        Self {
            slots,
            buffers,
            period: period.max(1),
            accumulated: 0,
        }
    }

    /// Apply happens on every `period`-th batch of an epoch, before that
    /// batch's gradients are accumulated.
    pub fn should_apply(&self, batch_index: usize) -> bool {
        batch_index % self.period == 0
    }

    /// Add the gradients of the tracked parameters; others are ignored.
    pub fn accumulate(&mut self, grads: &GradientsParams) {
        for (slot, buffer) in self.slots.iter().zip(self.buffers.iter_mut()) {
            if let Some(grad) = flat_gradient::<B>(grads, slot) {
                *buffer = buffer.clone() + grad;
            }
        }
        self.accumulated += 1;
    }

    /// Run `step` with the accumulated gradients, then zero the buffers.
    pub fn apply<R>(&mut self, step: impl FnOnce(GradientsParams) -> R) -> R {
        let mut grads = GradientsParams::new();
        for (slot, buffer) in self.slots.iter().zip(self.buffers.iter()) {
            register_shaped::<B>(&mut grads, slot, buffer.clone());
        }
        debug!(
            "Applying {} accumulated batches over {} parameters",
            self.accumulated,
            self.slots.len()
        );
        let output = step(grads);
        self.reset();
        output
    }

    fn reset(&mut self) {
        for buffer in self.buffers.iter_mut() {
            *buffer = buffer.zeros_like();
        }
        self.accumulated = 0;
    }

    /// Batches accumulated since the last apply.
    pub fn pending(&self) -> usize {
        self.accumulated
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }

    /// Sum of absolute values over every buffer.
    pub fn buffer_l1(&self) -> f32 {
        self.buffers
            .iter()
            .map(|buffer| buffer.clone().abs().sum().into_scalar().elem::<f32>())
            .sum()
    }
}

fn flat_gradient<B: Backend>(grads: &GradientsParams, slot: &ParamSlot) -> Option<Tensor<B, 1>> {
    let n = slot.num_elements();
    match slot.rank() {
        1 => grads.get::<B, 1>(slot.id),
        2 => grads.get::<B, 2>(slot.id).map(|g| g.reshape([n])),
        3 => grads.get::<B, 3>(slot.id).map(|g| g.reshape([n])),
        4 => grads.get::<B, 4>(slot.id).map(|g| g.reshape([n])),
        _ => None,
    }
}

fn register_shaped<B: Backend>(grads: &mut GradientsParams, slot: &ParamSlot, flat: Tensor<B, 1>) {
    let s = &slot.shape;
    match slot.rank() {
        1 => grads.register::<B, 1>(slot.id, flat),
        2 => grads.register::<B, 2>(slot.id, flat.reshape([s[0], s[1]])),
        3 => grads.register::<B, 3>(slot.id, flat.reshape([s[0], s[1], s[2]])),
        4 => grads.register::<B, 4>(slot.id, flat.reshape([s[0], s[1], s[2], s[3]])),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn slot(name: &str, shape: Vec<usize>) -> ParamSlot {
        ParamSlot {
            name: name.to_string(),
            id: ParamId::new(),
            shape,
        }
    }

    fn batch_grads(slots: &[ParamSlot], value: f32) -> GradientsParams {
        let device = Default::default();
        let mut grads = GradientsParams::new();
        grads.register::<TestBackend, 1>(
            slots[0].id,
            Tensor::ones([2], &device).mul_scalar(value),
        );
        grads.register::<TestBackend, 2>(
            slots[1].id,
            Tensor::ones([2, 3], &device).mul_scalar(value),
        );
        grads
    }

    #[test]
    fn test_buffer_is_zero_after_apply() {
        let device = Default::default();
        let slots = vec![slot("a/bias", vec![2]), slot("a/weight", vec![2, 3])];
        let mut acc = GradientAccumulator::<TestBackend>::new(slots.clone(), 4, &device);
        assert_eq!(acc.buffer_l1(), 0.0);

        for value in [1.0, 2.0, 3.0, 4.0] {
            acc.accumulate(&batch_grads(&slots, value));
        }
        assert_eq!(acc.pending(), 4);
        assert!((acc.buffer_l1() - 80.0).abs() < 1e-4);

        let applied = acc.apply(|grads| {
            let weight = grads.get::<TestBackend, 2>(slots[1].id).unwrap();
            assert_eq!(weight.dims(), [2, 3]);
            let bias = grads.get::<TestBackend, 1>(slots[0].id).unwrap();
            let mut values = weight.into_data().to_vec::<f32>().unwrap();
            values.extend(bias.into_data().to_vec::<f32>().unwrap());
            values
        });
        assert!(applied.iter().all(|v| (*v - 10.0).abs() < 1e-5));

        assert_eq!(acc.buffer_l1(), 0.0);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_untracked_gradients_ignored() {
        let device = Default::default();
        let slots = vec![slot("a/bias", vec![2]), slot("a/weight", vec![2, 3])];
        let tracked = vec![slots[0].clone()];
        let mut acc = GradientAccumulator::<TestBackend>::new(tracked, 4, &device);

        acc.accumulate(&batch_grads(&slots, 1.0));
        assert!((acc.buffer_l1() - 2.0).abs() < 1e-6);
        assert!(acc.contains(slots[0].id));
        assert!(!acc.contains(slots[1].id));

        let count = acc.apply(|grads| grads.len());
        assert_eq!(count, 1);
    }

    #[test]
    fn test_apply_schedule() {
        let device = Default::default();
        let acc = GradientAccumulator::<TestBackend>::new(Vec::new(), 4, &device);
        let applied: Vec<usize> = (0..10).filter(|i| acc.should_apply(*i)).collect();
        assert_eq!(applied, vec![0, 4, 8]);
    }

    #[test]
    fn test_apply_on_empty_buffer_hands_zeros() {
        let device = Default::default();
        let slots = vec![slot("a/weight", vec![2, 3])];
        let mut acc = GradientAccumulator::<TestBackend>::new(slots.clone(), 4, &device);
        let sum = acc.apply(|grads| {
            grads
                .get::<TestBackend, 2>(slots[0].id)
                .unwrap()
                .abs()
                .sum()
                .into_data()
                .to_vec::<f32>()
                .unwrap()[0]
        });
        assert_eq!(sum, 0.0);
    }
}
