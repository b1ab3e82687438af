//! Swapped-prediction loss across multi-resolution crops.
//!
//! Assignments computed from one crop supervise the temperature-scaled
//! predictions of every other crop. The assignment path (queue lookups,
//! exponentiation, balanced transport) is plain arithmetic with no backward
//! linkage; only the prediction path is differentiable, and
//! [`SwapLoss::backward`] emits its gradient with nothing flowing through
//! the targets.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

use crate::collective::Collective;
use crate::queue::FeatureQueue;
use crate::sinkhorn;
use crate::{Result, SwavError};

/// Hyperparameters of the swapped-prediction objective.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapLossConfig {
    /// Crop indices whose assignments act as targets; order fixes the
    /// queue-slot mapping.
    pub crops_for_assign: Vec<usize>,
    /// Total number of crops in the concatenated batch.
    pub total_crops: usize,
    /// Softmax temperature on the prediction path.
    pub temperature: f32,
    /// Regularization constant dividing the logits on the assignment path;
    /// distinct from (and typically smaller than) the temperature.
    pub epsilon: f32,
    /// Balancing iterations handed to the assignment engine.
    pub sinkhorn_iterations: usize,
}

impl SwapLossConfig {
    fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(SwavError::InvalidArgument(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(SwavError::InvalidArgument(format!(
                "epsilon must be > 0, got {}",
                self.epsilon
            )));
        }
        if self.crops_for_assign.is_empty() {
            return Err(SwavError::InvalidArgument(
                "at least one assignment crop is required".to_string(),
            ));
        }
        if self.total_crops < 2 {
            return Err(SwavError::InvalidArgument(
                "swapped prediction needs at least two crops".to_string(),
            ));
        }
        if let Some(&out_of_range) = self
            .crops_for_assign
            .iter()
            .find(|&&id| id >= self.total_crops)
        {
            return Err(SwavError::InvalidArgument(format!(
                "assignment crop {out_of_range} out of range for {} crops",
                self.total_crops
            )));
        }
        Ok(())
    }
}

struct SwapCache {
    /// Per assignment crop: crop id and its fixed `bs x K` target rows.
    targets: Vec<(usize, Array2<f32>)>,
    /// Temperature-scaled softmax of every crop's logit window.
    predictions: Vec<Array2<f32>>,
    batch: usize,
}

/// Multi-crop loss aggregator; owns the queue-activation latch handling and
/// the forward/backward cache.
pub struct SwapLoss {
    config: SwapLossConfig,
    cache: Option<SwapCache>,
}

impl std::fmt::Debug for SwapLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapLoss")
            .field("config", &self.config)
            .finish()
    }
}

fn log_softmax_rows(window: ArrayView2<'_, f32>, temperature: f32) -> Array2<f32> {
    let mut out = window.to_owned();
    out.mapv_inplace(|v| v / temperature);
    for mut row in out.rows_mut() {
        let max = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let log_sum = row
            .iter()
            .map(|&v| ((v - max) as f64).exp())
            .sum::<f64>()
            .ln() as f32;
        row.mapv_inplace(|v| v - max - log_sum);
    }
    out
}

impl SwapLoss {
    pub fn new(config: SwapLossConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache: None,
        })
    }

    pub fn config(&self) -> &SwapLossConfig {
        &self.config
    }

    fn check_shapes(
        &self,
        embeddings: &Array2<f32>,
        logits: &Array2<f32>,
        prototypes: &Array2<f32>,
        batch: usize,
    ) -> Result<()> {
        let expected_rows = self.config.total_crops * batch;
        if logits.nrows() != expected_rows {
            return Err(SwavError::Shape(format!(
                "logit batch has {} rows but {} crops x {batch} samples were configured; \
                 the augmentation pipeline and the loss must agree on the crop count",
                logits.nrows(),
                self.config.total_crops
            )));
        }
        if embeddings.nrows() != expected_rows {
            return Err(SwavError::Shape(format!(
                "embedding batch has {} rows, expected {expected_rows}",
                embeddings.nrows()
            )));
        }
        if logits.ncols() != prototypes.nrows() {
            return Err(SwavError::Shape(format!(
                "logits have {} prototype scores but {} prototypes exist",
                logits.ncols(),
                prototypes.nrows()
            )));
        }
        if embeddings.ncols() != prototypes.ncols() {
            return Err(SwavError::Shape(format!(
                "embedding dim {} does not match prototype dim {}",
                embeddings.ncols(),
                prototypes.ncols()
            )));
        }
        Ok(())
    }

    /// Computes the scalar loss for one concatenated multi-crop batch.
    ///
    /// `embeddings` and `logits` hold `total_crops` windows of `batch` rows
    /// each, crop-major. When a queue is supplied its content is advanced
    /// every step; its stored embeddings augment the assignment batch once
    /// the slot is primed or the latch was already set this epoch (the
    /// latch is one-way until the epoch resets it).
    #[allow(clippy::too_many_arguments)]
    pub fn forward<C: Collective>(
        &mut self,
        embeddings: &Array2<f32>,
        logits: &Array2<f32>,
        prototypes: &Array2<f32>,
        batch: usize,
        mut queue: Option<&mut FeatureQueue>,
        queue_in_use: &mut bool,
        collective: &C,
    ) -> Result<f32> {
        self.check_shapes(embeddings, logits, prototypes, batch)?;
        let total = self.config.total_crops;

        let predictions: Vec<Array2<f32>> = (0..total)
            .map(|v| {
                log_softmax_rows(
                    logits.slice(s![v * batch..(v + 1) * batch, ..]),
                    self.config.temperature,
                )
            })
            .collect();

        let mut loss = 0.0f32;
        let mut targets = Vec::with_capacity(self.config.crops_for_assign.len());

        for (slot, &crop_id) in self.config.crops_for_assign.iter().enumerate() {
            let window = logits.slice(s![crop_id * batch..(crop_id + 1) * batch, ..]);
            let mut scores = window.to_owned();

            if let Some(queue) = queue.as_deref_mut() {
                if *queue_in_use || queue.primed(slot) {
                    *queue_in_use = true;
                    let virtual_scores = queue.project(slot, prototypes);
                    scores = concatenate(Axis(0), &[virtual_scores.view(), scores.view()])
                        .map_err(|err| SwavError::Shape(err.to_string()))?;
                }
                queue.advance(
                    slot,
                    embeddings.slice(s![crop_id * batch..(crop_id + 1) * batch, ..]),
                )?;
            }

            let similarity = scores
                .mapv(|v| (v / self.config.epsilon).exp())
                .reversed_axes();
            let assignments = sinkhorn::balanced_assignments(
                similarity,
                self.config.sinkhorn_iterations,
                collective,
            )?;
            let rows = assignments.nrows();
            let target = assignments.slice(s![rows - batch.., ..]).to_owned();

            let mut subloss = 0.0f32;
            for (v, prediction) in predictions.iter().enumerate() {
                if v == crop_id {
                    continue;
                }
                if prediction.nrows() != target.nrows() {
                    return Err(SwavError::Shape(format!(
                        "assignment rows ({}) disagree with prediction rows ({}) for crop {v}",
                        target.nrows(),
                        prediction.nrows()
                    )));
                }
                let cross: f32 = (&target * prediction).sum();
                subloss -= cross / batch as f32;
            }
            loss += subloss / (total - 1) as f32;
            targets.push((crop_id, target));
        }

        loss /= self.config.crops_for_assign.len() as f32;

        self.cache = Some(SwapCache {
            targets,
            predictions: predictions.into_iter().map(|p| p.mapv(f32::exp)).collect(),
            batch,
        });
        Ok(loss)
    }

    /// Gradient of the last forward pass with respect to the full logit
    /// batch, `(total_crops * batch) x K`.
    ///
    /// Targets are constants: an assignment crop's own window receives
    /// gradient only through the terms where it is predicted by the other
    /// assignment crops.
    pub fn backward(&mut self) -> Result<Array2<f32>> {
        let cache = self.cache.take().ok_or_else(|| {
            SwavError::InvalidArgument("backward called without a cached forward pass".to_string())
        })?;
        let total = self.config.total_crops;
        let batch = cache.batch;
        let classes = cache.predictions[0].ncols();
        let scale = 1.0
            / (self.config.temperature
                * batch as f32
                * (total - 1) as f32
                * cache.targets.len() as f32);

        let mut gradient = Array2::<f32>::zeros((total * batch, classes));
        for (crop_id, target) in &cache.targets {
            for (v, prediction) in cache.predictions.iter().enumerate() {
                if v == *crop_id {
                    continue;
                }
                let contribution = (prediction - target).mapv(|g| g * scale);
                gradient
                    .slice_mut(s![v * batch..(v + 1) * batch, ..])
                    .zip_mut_with(&contribution, |g, c| *g += *c);
            }
        }
        Ok(gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::SingleProcess;

    fn config(crops_for_assign: Vec<usize>, total: usize) -> SwapLossConfig {
        SwapLossConfig {
            crops_for_assign,
            total_crops: total,
            temperature: 0.1,
            epsilon: 0.05,
            sinkhorn_iterations: 3,
        }
    }

    fn toy_inputs(total: usize, batch: usize) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let dim = 3;
        let classes = 4;
        let embeddings = Array2::from_shape_fn((total * batch, dim), |(r, c)| {
            ((r * dim + c) as f32 * 0.37).sin()
        });
        let prototypes = Array2::from_shape_fn((classes, dim), |(r, c)| {
            ((r * dim + c) as f32 * 0.53).cos()
        });
        let logits = embeddings.dot(&prototypes.t());
        (embeddings, logits, prototypes)
    }

    #[test]
    fn loss_is_finite_for_any_assignment_subset() {
        let (embeddings, logits, prototypes) = toy_inputs(3, 2);
        for crops_for_assign in [vec![0, 1], vec![1, 2], vec![2]] {
            let mut loss = SwapLoss::new(config(crops_for_assign, 3)).unwrap();
            let mut latch = false;
            let value = loss
                .forward(
                    &embeddings,
                    &logits,
                    &prototypes,
                    2,
                    None,
                    &mut latch,
                    &SingleProcess,
                )
                .unwrap();
            assert!(value.is_finite());
            assert!(value >= 0.0, "cross-entropy against a softmax, got {value}");
        }
    }

    #[test]
    fn queue_augments_once_primed_and_latch_sticks() {
        let (embeddings, logits, prototypes) = toy_inputs(2, 2);
        let mut loss = SwapLoss::new(config(vec![0, 1], 2)).unwrap();
        let mut queue = FeatureQueue::zeros(2, 4, 3);
        let mut latch = false;

        // two steps fill the 4-row queue; the latch stays clear until the
        // oldest row is non-zero
        for _ in 0..2 {
            loss.forward(
                &embeddings,
                &logits,
                &prototypes,
                2,
                Some(&mut queue),
                &mut latch,
                &SingleProcess,
            )
            .unwrap();
        }
        assert!(!latch);
        loss.forward(
            &embeddings,
            &logits,
            &prototypes,
            2,
            Some(&mut queue),
            &mut latch,
            &SingleProcess,
        )
        .unwrap();
        assert!(latch, "latch must set once the oldest window is non-zero");
    }

    #[test]
    fn backward_leaves_target_paths_gradient_free() {
        let (embeddings, logits, prototypes) = toy_inputs(2, 2);
        let mut loss = SwapLoss::new(config(vec![0], 2)).unwrap();
        let mut latch = false;
        loss.forward(
            &embeddings,
            &logits,
            &prototypes,
            2,
            None,
            &mut latch,
            &SingleProcess,
        )
        .unwrap();
        let gradient = loss.backward().unwrap();
        assert_eq!(gradient.dim(), (4, 4));
        // crop 0 only supplies targets, so its window receives no gradient
        assert!(gradient.slice(s![..2, ..]).iter().all(|g| *g == 0.0));
        assert!(gradient.slice(s![2.., ..]).iter().any(|g| *g != 0.0));
        // each gradient row of a softmax cross-entropy sums to ~0
        for row in gradient.slice(s![2.., ..]).rows() {
            assert!(row.sum().abs() < 1e-5);
        }
    }

    #[test]
    fn rejects_mismatched_crop_count() {
        let (embeddings, logits, prototypes) = toy_inputs(3, 2);
        let mut loss = SwapLoss::new(config(vec![0, 1], 4)).unwrap();
        let mut latch = false;
        let result = loss.forward(
            &embeddings,
            &logits,
            &prototypes,
            2,
            None,
            &mut latch,
            &SingleProcess,
        );
        assert!(matches!(result, Err(SwavError::Shape(_))));
    }

    #[test]
    fn backward_needs_a_forward_pass() {
        let mut loss = SwapLoss::new(config(vec![0], 2)).unwrap();
        assert!(loss.backward().is_err());
    }
}
