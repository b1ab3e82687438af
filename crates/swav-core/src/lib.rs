//! Training-time core of a clustering-based self-supervised objective.
//!
//! A batch of multi-resolution crops is turned into a scalar loss by
//! balancing prototype similarities into soft assignments (an iterative
//! balanced-transport normalization, optionally synchronized across
//! workers), augmenting the assignment batch with a rolling queue of past
//! embeddings, and cross-predicting assignments between crops with a
//! temperature-scaled objective.

pub mod collective;
pub mod config;
pub mod loss;
pub mod prototypes;
pub mod queue;
pub mod schedule;
pub mod sinkhorn;
pub mod trainer;

use thiserror::Error;

/// Errors surfaced by the training core.
#[derive(Debug, Error, PartialEq)]
pub enum SwavError {
    /// Raised when inputs have mismatched batch, crop or feature dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when an invalid parameter (temperature, crop ids, etc.) is provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Raised when a collective reduction fails; fatal to the worker group.
    #[error("collective failure: {0}")]
    Collective(#[from] collective::CollectiveError),
    #[error("io error: {message}")]
    Io { message: String },
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

pub type Result<T> = std::result::Result<T, SwavError>;
