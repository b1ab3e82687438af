//! Recognized training options and their validation.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::{Result, SwavError};

/// Dataset the trainer is pointed at. Unknown names fail deserialization,
/// which is fatal at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Stl10,
    Cifar10,
    Imagenet,
}

/// Encoder architecture used for pre-training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Resnet18,
    Resnet50,
}

/// Base optimizer; a trust-ratio wrapper may be layered on top externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Full recognized configuration surface of the training core.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SwavConfig {
    /// Number of image samples used for training.
    pub num_samples: usize,
    pub dataset: Dataset,
    #[serde(default = "SwavConfig::default_num_nodes")]
    pub num_nodes: usize,
    #[serde(default = "SwavConfig::default_arch")]
    pub arch: Arch,
    /// Hidden layer width of the projection head; 0 selects a linear head.
    #[serde(default = "SwavConfig::default_hidden_mlp")]
    pub hidden_mlp: usize,
    /// Output dimension of the projection head.
    #[serde(default = "SwavConfig::default_feat_dim")]
    pub feat_dim: usize,
    #[serde(default = "SwavConfig::default_warmup_epochs")]
    pub warmup_epochs: usize,
    #[serde(default = "SwavConfig::default_max_epochs")]
    pub max_epochs: usize,
    /// Count of cluster prototype vectors.
    #[serde(default = "SwavConfig::default_nmb_prototypes")]
    pub nmb_prototypes: usize,
    /// Epoch until which prototype gradients are discarded.
    #[serde(default = "SwavConfig::default_freeze_prototypes_epochs")]
    pub freeze_prototypes_epochs: usize,
    #[serde(default = "SwavConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "SwavConfig::default_sinkhorn_iterations")]
    pub sinkhorn_iterations: usize,
    /// Total queue length across workers; 0 disables the queue. Must be
    /// divisible by the worker count, checked at allocation.
    #[serde(default)]
    pub queue_length: usize,
    /// Folder for queue snapshots, inside the log directory.
    #[serde(default = "SwavConfig::default_queue_path")]
    pub queue_path: String,
    /// Epoch from which the queue starts being used.
    #[serde(default = "SwavConfig::default_epoch_queue_starts")]
    pub epoch_queue_starts: usize,
    /// Crop ids used for computing assignments, in queue-slot order.
    #[serde(default = "SwavConfig::default_crops_for_assign")]
    pub crops_for_assign: Vec<usize>,
    /// Number of crops per resolution, e.g. `[2, 6]`.
    #[serde(default = "SwavConfig::default_nmb_crops")]
    pub nmb_crops: Vec<usize>,
    #[serde(default = "SwavConfig::default_true")]
    pub first_conv: bool,
    #[serde(default = "SwavConfig::default_true")]
    pub maxpool1: bool,
    #[serde(default = "SwavConfig::default_optimizer")]
    pub optimizer: OptimizerKind,
    #[serde(default = "SwavConfig::default_true")]
    pub lars_wrapper: bool,
    #[serde(default)]
    pub exclude_bn_bias: bool,
    #[serde(default)]
    pub start_lr: f32,
    #[serde(default = "SwavConfig::default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub final_lr: f32,
    #[serde(default = "SwavConfig::default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "SwavConfig::default_epsilon")]
    pub epsilon: f32,
}

impl SwavConfig {
    fn default_num_nodes() -> usize {
        1
    }

    fn default_arch() -> Arch {
        Arch::Resnet50
    }

    fn default_hidden_mlp() -> usize {
        2048
    }

    fn default_feat_dim() -> usize {
        128
    }

    fn default_warmup_epochs() -> usize {
        10
    }

    fn default_max_epochs() -> usize {
        100
    }

    fn default_nmb_prototypes() -> usize {
        3000
    }

    fn default_freeze_prototypes_epochs() -> usize {
        1
    }

    fn default_temperature() -> f32 {
        0.1
    }

    fn default_sinkhorn_iterations() -> usize {
        3
    }

    fn default_queue_path() -> String {
        "queue".to_string()
    }

    fn default_epoch_queue_starts() -> usize {
        15
    }

    fn default_crops_for_assign() -> Vec<usize> {
        vec![0, 1]
    }

    fn default_nmb_crops() -> Vec<usize> {
        vec![2, 6]
    }

    fn default_true() -> bool {
        true
    }

    fn default_optimizer() -> OptimizerKind {
        OptimizerKind::Adam
    }

    fn default_learning_rate() -> f32 {
        1e-3
    }

    fn default_weight_decay() -> f32 {
        1e-6
    }

    fn default_epsilon() -> f32 {
        0.05
    }

    /// Total number of crops in one multi-resolution batch.
    pub fn total_crops(&self) -> usize {
        self.nmb_crops.iter().sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.feat_dim == 0 {
            return Err(SwavError::InvalidArgument(
                "feat_dim must be > 0".to_string(),
            ));
        }
        if self.nmb_prototypes == 0 {
            return Err(SwavError::InvalidArgument(
                "nmb_prototypes must be > 0".to_string(),
            ));
        }
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
        if self.warmup_epochs > self.max_epochs {
            return Err(SwavError::InvalidArgument(format!(
                "warmup_epochs ({}) exceeds max_epochs ({})",
                self.warmup_epochs, self.max_epochs
            )));
        }
        if self.nmb_crops.is_empty() {
            return Err(SwavError::InvalidArgument(
                "nmb_crops must not be empty".to_string(),
            ));
        }
        if self.crops_for_assign.is_empty() {
            return Err(SwavError::InvalidArgument(
                "crops_for_assign must not be empty".to_string(),
            ));
        }
        let total = self.total_crops();
        if let Some(&id) = self.crops_for_assign.iter().find(|&&id| id >= total) {
            return Err(SwavError::InvalidArgument(format!(
                "assignment crop {id} out of range for {total} crops"
            )));
        }
        Ok(())
    }

    /// Parses and validates a TOML configuration string.
    pub fn from_toml_str(config: &str) -> Result<Self> {
        let parsed: SwavConfig = toml::from_str(config).map_err(|err| {
            SwavError::InvalidArgument(format!("failed to parse training config: {err}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reads and validates a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(|err| {
            SwavError::InvalidArgument(format!(
                "failed to read training config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config = SwavConfig::from_toml_str(
            r#"
            num_samples = 100000
            dataset = "stl10"
            "#,
        )
        .unwrap();
        assert_eq!(config.arch, Arch::Resnet50);
        assert_eq!(config.nmb_crops, vec![2, 6]);
        assert_eq!(config.total_crops(), 8);
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert!((config.epsilon - 0.05).abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_dataset_is_fatal() {
        let result = SwavConfig::from_toml_str(
            r#"
            num_samples = 100
            dataset = "mnist"
            "#,
        );
        assert!(matches!(result, Err(SwavError::InvalidArgument(_))));
    }

    #[test]
    fn out_of_range_assignment_crop_is_rejected() {
        let result = SwavConfig::from_toml_str(
            r#"
            num_samples = 100
            dataset = "cifar10"
            nmb_crops = [2, 1]
            crops_for_assign = [0, 3]
            "#,
        );
        assert!(matches!(result, Err(SwavError::InvalidArgument(_))));
    }
}
