//! Seams to the external collaborators: the backbone network that produces
//! embeddings and prototype logits, and the (possibly trust-ratio-wrapped)
//! optimizer.

use ndarray::{Array2, ArrayView2};

use crate::Result;

/// Backbone + projection/prototype head, consumed at its interface only.
///
/// `forward` receives the multi-resolution crops and returns the
/// concatenated `(embeddings, prototype logits)` pair, crop-major with the
/// same batch size per crop. The prototype weight matrix (one row per
/// cluster) must support in-place normalization; gradients are exposed by
/// parameter name so the freeze gate can match the prototype group.
pub trait Backbone {
    fn forward(&mut self, crops: &[ArrayView2<'_, f32>]) -> Result<(Array2<f32>, Array2<f32>)>;

    fn prototype_weights(&self) -> &Array2<f32>;

    fn prototype_weights_mut(&mut self) -> &mut Array2<f32>;

    /// Named gradient slots filled by the most recent backward pass.
    fn gradients_mut(&mut self) -> Vec<(&str, &mut Option<Array2<f32>>)>;
}

/// One optimizer parameter group with a directly writable learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    /// Names of the parameters driven by this group.
    pub params: Vec<String>,
    pub lr: f32,
    pub weight_decay: f32,
}

/// Optimizer interface: mutable parameter groups plus a closure-driven step.
///
/// The learning rate is written straight into every group at step time; a
/// trust-ratio wrapper around the real optimizer does not expose a stepped
/// scheduler, so no scheduler object is involved.
pub trait Optimizer {
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    fn step(&mut self, closure: &mut dyn FnMut() -> Result<f32>) -> Result<f32>;
}

/// Parameter-name substrings excluded from weight decay by default.
pub const DEFAULT_WD_SKIP: &[&str] = &["bias", "bn"];

/// Splits named parameters into a decayed group and a zero-decay group.
///
/// Parameters whose name contains any entry of `skip` (batch-norm scales
/// and biases, typically) land in the zero-decay group. Learning rates are
/// left at zero; the schedule overwrites them on every step.
pub fn exclude_from_weight_decay<I, S>(names: I, weight_decay: f32, skip: &[&str]) -> Vec<ParamGroup>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut decayed = Vec::new();
    let mut excluded = Vec::new();
    for name in names {
        let name = name.into();
        if skip.iter().any(|pattern| name.contains(pattern)) {
            excluded.push(name);
        } else {
            decayed.push(name);
        }
    }
    vec![
        ParamGroup {
            params: decayed,
            lr: 0.0,
            weight_decay,
        },
        ParamGroup {
            params: excluded,
            lr: 0.0,
            weight_decay: 0.0,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_decay_exclusion_splits_by_substring() {
        let groups = exclude_from_weight_decay(
            [
                "encoder.conv1.weight",
                "encoder.bn1.weight",
                "projection_head.0.bias",
                "prototypes.weight",
            ],
            1e-6,
            DEFAULT_WD_SKIP,
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].params,
            vec!["encoder.conv1.weight", "prototypes.weight"]
        );
        assert!((groups[0].weight_decay - 1e-6).abs() < f32::EPSILON);
        assert_eq!(
            groups[1].params,
            vec!["encoder.bn1.weight", "projection_head.0.bias"]
        );
        assert_eq!(groups[1].weight_decay, 0.0);
    }
}
