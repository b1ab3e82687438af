//! Per-step learning-rate curve: linear warmup followed by cosine decay.

use std::f64::consts::PI;

/// Flat step-indexed learning-rate curve.
///
/// Regenerated at every epoch start rather than updated incrementally: the
/// step count per epoch is only known once the epoch's loader length is, so
/// the whole curve is cheap to rebuild and the current value is a plain
/// lookup by global step. The value is written straight into the optimizer's
/// parameter groups because a trust-ratio wrapper may hide any stepped
/// scheduler interface.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    values: Vec<f32>,
}

impl LrSchedule {
    /// Builds the full curve for the current trainer configuration.
    ///
    /// Warmup ramps linearly from `start_lr` to `base_lr` over
    /// `warmup_epochs * steps_per_epoch` steps with an inclusive endpoint;
    /// the remaining `(max_epochs - warmup_epochs) * steps_per_epoch` steps
    /// decay as `final_lr + 0.5 * (base_lr - final_lr) * (1 + cos(pi*t/T))`.
    pub fn new(
        start_lr: f32,
        base_lr: f32,
        final_lr: f32,
        warmup_epochs: usize,
        max_epochs: usize,
        steps_per_epoch: usize,
    ) -> Self {
        let warmup_steps = warmup_epochs * steps_per_epoch;
        let decay_steps = max_epochs.saturating_sub(warmup_epochs) * steps_per_epoch;
        let mut values = Vec::with_capacity(warmup_steps + decay_steps);

        for step in 0..warmup_steps {
            let fraction = if warmup_steps > 1 {
                step as f64 / (warmup_steps - 1) as f64
            } else {
                0.0
            };
            values.push((start_lr as f64 + (base_lr as f64 - start_lr as f64) * fraction) as f32);
        }

        for step in 0..decay_steps {
            let phase = PI * step as f64 / decay_steps as f64;
            let value =
                final_lr as f64 + 0.5 * (base_lr as f64 - final_lr as f64) * (1.0 + phase.cos());
            values.push(value as f32);
        }

        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Learning rate at the given global step, if the curve covers it.
    pub fn at(&self, global_step: usize) -> Option<f32> {
        self.values.get(global_step).copied()
    }
}
