//! Prototype weight upkeep: per-step unit normalization and the
//! early-training gradient gate.

use ndarray::Array2;

/// Substring identifying the prototype parameter group by name.
pub const PROTOTYPE_TAG: &str = "prototypes";

/// Rescales every row of `weights` to unit L2 norm, in place.
///
/// Every training step begins with unit-norm prototypes; the head only ever
/// sees the normalized matrix.
pub fn normalize_rows(weights: &mut Array2<f32>) {
    for mut row in weights.rows_mut() {
        let norm = row.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt() as f32;
        let norm = norm.max(f32::EPSILON);
        row.mapv_inplace(|v| v / norm);
    }
}

/// Gate state for the prototype parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Prototype gradients are discarded after every backward pass.
    Frozen,
    /// Gradients flow normally.
    Active,
}

/// Epoch-conditioned filter that freezes prototype gradients early in
/// training, preventing prototype drift before representations stabilize.
///
/// The transition from [`GateState::Frozen`] to [`GateState::Active`] is
/// monotonic: it happens once, when the epoch counter crosses the
/// configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrototypeGate {
    freeze_epochs: usize,
}

impl PrototypeGate {
    pub fn new(freeze_epochs: usize) -> Self {
        Self { freeze_epochs }
    }

    pub fn state(&self, epoch: usize) -> GateState {
        if epoch < self.freeze_epochs {
            GateState::Frozen
        } else {
            GateState::Active
        }
    }

    /// Clears every gradient whose parameter name contains
    /// [`PROTOTYPE_TAG`] while the gate is frozen; a no-op once active.
    ///
    /// Call after the backward pass and before the optimizer consumes the
    /// gradients. Discarded means absent, not zero-filled.
    pub fn apply<'a, I>(&self, epoch: usize, gradients: I)
    where
        I: IntoIterator<Item = (&'a str, &'a mut Option<Array2<f32>>)>,
    {
        if self.state(epoch) == GateState::Active {
            return;
        }
        for (name, gradient) in gradients {
            if name.contains(PROTOTYPE_TAG) {
                *gradient = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rows_become_unit_norm() {
        let mut weights = array![[3.0f32, 4.0], [0.0, 2.0]];
        normalize_rows(&mut weights);
        assert!((weights[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((weights[[0, 1]] - 0.8).abs() < 1e-6);
        assert!((weights[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn frozen_gate_clears_only_prototype_gradients() {
        let gate = PrototypeGate::new(2);
        let mut head = Some(array![[1.0f32]]);
        let mut prototypes = Some(array![[1.0f32]]);
        gate.apply(
            1,
            [
                ("projection_head.weight", &mut head),
                ("prototypes.weight", &mut prototypes),
            ],
        );
        assert!(head.is_some());
        assert!(prototypes.is_none());
    }

    #[test]
    fn gate_opens_at_threshold() {
        let gate = PrototypeGate::new(2);
        assert_eq!(gate.state(1), GateState::Frozen);
        assert_eq!(gate.state(2), GateState::Active);
        assert_eq!(gate.state(100), GateState::Active);

        let mut prototypes = Some(array![[1.0f32]]);
        gate.apply(2, [("prototypes.weight", &mut prototypes)]);
        assert!(prototypes.is_some());
    }
}
