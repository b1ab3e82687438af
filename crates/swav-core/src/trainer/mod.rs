//! Per-run training context and epoch-boundary hooks.
//!
//! Everything the original training loop kept as ambient instance state —
//! the lazily allocated queue, the one-way queue-activation latch, the
//! step-indexed learning-rate curve — lives in an explicit [`EpochContext`]
//! that is rebuilt or reset at well-defined epoch boundaries.

mod interfaces;

pub use interfaces::{
    exclude_from_weight_decay, Backbone, Optimizer, ParamGroup, DEFAULT_WD_SKIP,
};

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};

use crate::collective::Collective;
use crate::config::SwavConfig;
use crate::loss::{SwapLoss, SwapLossConfig};
use crate::prototypes::{self, PrototypeGate};
use crate::queue::FeatureQueue;
use crate::schedule::LrSchedule;
use crate::{Result, SwavError};

/// Epoch-scoped mutable state, reset or rebuilt at epoch boundaries.
#[derive(Debug)]
pub struct EpochContext {
    /// Feature queue, allocated lazily once the start epoch is reached.
    pub queue: Option<FeatureQueue>,
    /// One-way latch: once any slot augments within an epoch, every later
    /// step does too. Cleared at epoch start.
    pub queue_in_use: bool,
    /// Learning-rate curve over the whole run, indexed by global step.
    pub lr_curve: LrSchedule,
}

impl EpochContext {
    fn new() -> Self {
        Self {
            queue: None,
            queue_in_use: false,
            lr_curve: LrSchedule::new(0.0, 0.0, 0.0, 0, 0, 0),
        }
    }
}

/// Drives one worker's training-time core across epochs and steps.
pub struct SwavTrainer<C: Collective> {
    config: SwavConfig,
    collective: C,
    context: EpochContext,
    loss: SwapLoss,
    gate: PrototypeGate,
    queue_file: Option<PathBuf>,
    current_epoch: usize,
    global_step: usize,
}

impl<C: Collective> SwavTrainer<C> {
    pub fn new(config: SwavConfig, collective: C) -> Result<Self> {
        config.validate()?;
        let loss = SwapLoss::new(SwapLossConfig {
            crops_for_assign: config.crops_for_assign.clone(),
            total_crops: config.total_crops(),
            temperature: config.temperature,
            epsilon: config.epsilon,
            sinkhorn_iterations: config.sinkhorn_iterations,
        })?;
        let gate = PrototypeGate::new(config.freeze_prototypes_epochs);
        Ok(Self {
            config,
            collective,
            context: EpochContext::new(),
            loss,
            gate,
            queue_file: None,
            current_epoch: 0,
            global_step: 0,
        })
    }

    pub fn config(&self) -> &SwavConfig {
        &self.config
    }

    pub fn context(&self) -> &EpochContext {
        &self.context
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Resolves this worker's queue snapshot path under `log_dir` and
    /// restores a previously persisted queue if one exists. A missing file
    /// just means a fresh start.
    pub fn setup(&mut self, log_dir: &Path) -> Result<()> {
        if self.config.queue_length == 0 {
            return Ok(());
        }
        let folder = log_dir.join(&self.config.queue_path);
        fs::create_dir_all(&folder).map_err(|err| SwavError::Io {
            message: err.to_string(),
        })?;
        let path = folder.join(format!("queue{}.json", self.collective.rank()));
        if path.is_file() {
            self.context.queue = Some(FeatureQueue::load(&path)?);
        }
        self.queue_file = Some(path);
        Ok(())
    }

    /// Rebuilds the LR curve for the epoch's step count, allocates the
    /// queue once the configured start epoch is reached and clears the
    /// in-use latch.
    pub fn on_epoch_start(&mut self, steps_per_epoch: usize) -> Result<()> {
        self.context.lr_curve = LrSchedule::new(
            self.config.start_lr,
            self.config.learning_rate,
            self.config.final_lr,
            self.config.warmup_epochs,
            self.config.max_epochs,
            steps_per_epoch,
        );

        if self.config.queue_length > 0
            && self.current_epoch >= self.config.epoch_queue_starts
            && self.context.queue.is_none()
        {
            let world_size = self.collective.world_size();
            if self.config.queue_length % world_size != 0 {
                return Err(SwavError::InvalidArgument(format!(
                    "queue_length {} is not divisible by the worker count {world_size}",
                    self.config.queue_length
                )));
            }
            self.context.queue = Some(FeatureQueue::zeros(
                self.config.crops_for_assign.len(),
                self.config.queue_length / world_size,
                self.config.feat_dim,
            ));
            tracing::info!(
                epoch = self.current_epoch,
                capacity = self.config.queue_length / world_size,
                "allocated feature queue"
            );
        }

        self.context.queue_in_use = false;
        Ok(())
    }

    /// One training step: normalize prototypes, run the backbone over all
    /// crops and aggregate the swapped-prediction loss.
    pub fn training_step<B: Backbone>(
        &mut self,
        backbone: &mut B,
        crops: &[ArrayView2<'_, f32>],
    ) -> Result<f32> {
        let batch = crops
            .first()
            .map(|crop| crop.nrows())
            .ok_or_else(|| SwavError::InvalidArgument("at least one crop is required".into()))?;

        prototypes::normalize_rows(backbone.prototype_weights_mut());
        let (embeddings, logits) = backbone.forward(crops)?;
        self.loss.forward(
            &embeddings,
            &logits,
            backbone.prototype_weights(),
            batch,
            self.context.queue.as_mut(),
            &mut self.context.queue_in_use,
            &self.collective,
        )
    }

    /// Loss over the same path but without touching the queue or the latch;
    /// used for held-out evaluation.
    pub fn validation_step<B: Backbone>(
        &mut self,
        backbone: &mut B,
        crops: &[ArrayView2<'_, f32>],
    ) -> Result<f32> {
        let batch = crops
            .first()
            .map(|crop| crop.nrows())
            .ok_or_else(|| SwavError::InvalidArgument("at least one crop is required".into()))?;

        prototypes::normalize_rows(backbone.prototype_weights_mut());
        let (embeddings, logits) = backbone.forward(crops)?;
        let mut latch = false;
        self.loss.forward(
            &embeddings,
            &logits,
            backbone.prototype_weights(),
            batch,
            None,
            &mut latch,
            &self.collective,
        )
    }

    /// Gradient of the most recent loss with respect to the logit batch.
    pub fn loss_backward(&mut self) -> Result<Array2<f32>> {
        self.loss.backward()
    }

    /// Discards prototype gradients while the gate is frozen. Call after
    /// every backward pass, before the optimizer consumes the gradients.
    pub fn on_after_backward<B: Backbone>(&self, backbone: &mut B) {
        self.gate.apply(self.current_epoch, backbone.gradients_mut());
    }

    /// Learning rate scheduled for the current global step, if the curve
    /// covers it.
    pub fn scheduled_lr(&self) -> Option<f32> {
        self.context.lr_curve.at(self.global_step)
    }

    /// Writes the scheduled learning rate into every parameter group, runs
    /// the optimizer step with `closure` and advances the global step.
    pub fn optimizer_step<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        closure: &mut dyn FnMut() -> Result<f32>,
    ) -> Result<f32> {
        let lr = self.scheduled_lr().ok_or_else(|| {
            SwavError::InvalidArgument(format!(
                "global step {} is outside the {}-step learning-rate curve",
                self.global_step,
                self.context.lr_curve.len()
            ))
        })?;
        for group in optimizer.param_groups_mut() {
            group.lr = lr;
        }
        tracing::debug!(step = self.global_step, lr, "applied scheduled learning rate");
        let value = optimizer.step(closure)?;
        self.global_step += 1;
        Ok(value)
    }

    /// Persists the queue (when active) and advances the epoch counter.
    pub fn on_epoch_end(&mut self) -> Result<()> {
        if let (Some(queue), Some(path)) = (self.context.queue.as_ref(), self.queue_file.as_ref()) {
            queue.save(path)?;
        }
        self.current_epoch += 1;
        Ok(())
    }
}
