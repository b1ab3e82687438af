// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of swav-rs — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Rolling per-crop cache of past embeddings.
//!
//! One fixed-size matrix per assignment crop, evicted in batch-sized blocks:
//! the newest embeddings occupy the leading rows, the oldest fall off the
//! far end. Entries are plain detached values; nothing stored here ever
//! participates in backpropagation. The buffer is serialized per worker at
//! every epoch end and reloaded verbatim on restart.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::{Result, SwavError};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredMatrix {
    fn from_matrix(matrix: &Array2<f32>) -> StoredMatrix {
        StoredMatrix {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            data: matrix.iter().copied().collect(),
        }
    }

    fn into_matrix(self) -> Result<Array2<f32>> {
        Array2::from_shape_vec((self.rows, self.cols), self.data)
            .map_err(|err| SwavError::Shape(format!("stored queue matrix: {err}")))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    queue: Vec<StoredMatrix>,
}

fn io_error(err: std::io::Error) -> SwavError {
    SwavError::Io {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> SwavError {
    SwavError::Serialization {
        message: err.to_string(),
    }
}

/// Ring buffer of historical embeddings, one slot per assignment crop.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureQueue {
    slots: Vec<Array2<f32>>,
}

impl FeatureQueue {
    /// Allocates `slots` zeroed buffers of `capacity` rows by `feat_dim`.
    ///
    /// `capacity` is the per-worker share of the configured queue length;
    /// the buffer is never resized after allocation.
    pub fn zeros(slots: usize, capacity: usize, feat_dim: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| Array2::zeros((capacity, feat_dim))).collect(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.first().map(|m| m.nrows()).unwrap_or(0)
    }

    pub fn feat_dim(&self) -> usize {
        self.slots.first().map(|m| m.ncols()).unwrap_or(0)
    }

    /// Stored embeddings for one slot, newest first.
    pub fn slot(&self, slot: usize) -> ArrayView2<'_, f32> {
        self.slots[slot].view()
    }

    /// True once the slot's oldest row holds a non-zero entry, i.e. the
    /// buffer has wrapped far enough to be full of real embeddings.
    pub fn primed(&self, slot: usize) -> bool {
        let matrix = &self.slots[slot];
        match matrix.nrows() {
            0 => false,
            rows => matrix.row(rows - 1).iter().any(|v| *v != 0.0),
        }
    }

    /// Similarities of the stored embeddings against the prototype vectors:
    /// `queue[slot] @ prototypes.T`, a `capacity x K` matrix.
    pub fn project(&self, slot: usize, prototypes: &Array2<f32>) -> Array2<f32> {
        self.slots[slot].dot(&prototypes.t())
    }

    /// Shifts the slot back by the batch size and writes `batch` into the
    /// vacated leading rows. Eviction is by batch-sized blocks, oldest first.
    pub fn advance(&mut self, slot: usize, batch: ArrayView2<'_, f32>) -> Result<()> {
        let matrix = &mut self.slots[slot];
        let (capacity, feat_dim) = matrix.dim();
        let size = batch.nrows();
        if batch.ncols() != feat_dim {
            return Err(SwavError::Shape(format!(
                "queue feature dim {feat_dim} does not match batch dim {}",
                batch.ncols()
            )));
        }
        if size > capacity {
            return Err(SwavError::Shape(format!(
                "batch of {size} rows exceeds queue capacity {capacity}"
            )));
        }
        let kept = matrix.slice(s![..capacity - size, ..]).to_owned();
        matrix.slice_mut(s![size.., ..]).assign(&kept);
        matrix.slice_mut(s![..size, ..]).assign(&batch);
        Ok(())
    }

    /// Serializes every slot to `path` under the single `"queue"` key.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = QueueSnapshot {
            queue: self.slots.iter().map(StoredMatrix::from_matrix).collect(),
        };
        let file = File::create(path.as_ref()).map_err(io_error)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, &snapshot).map_err(serde_error)?;
        tracing::debug!(path = %path.as_ref().display(), "persisted feature queue snapshot");
        Ok(())
    }

    /// Loads a snapshot written by [`FeatureQueue::save`], verbatim.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(io_error)?;
        let reader = BufReader::new(file);
        let snapshot: QueueSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
        let slots = snapshot
            .queue
            .into_iter()
            .map(StoredMatrix::into_matrix)
            .collect::<Result<Vec<_>>>()?;
        if let Some(first) = slots.first() {
            let dim = first.dim();
            if slots.iter().any(|m| m.dim() != dim) {
                return Err(SwavError::Shape(
                    "queue snapshot slots disagree on shape".to_string(),
                ));
            }
        }
        tracing::debug!(path = %path.as_ref().display(), "restored feature queue snapshot");
        Ok(Self { slots })
    }
}
