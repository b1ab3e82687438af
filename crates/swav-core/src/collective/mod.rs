// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of swav-rs — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Collective-communication capability injected into the assignment engine.
//!
//! The engine never consults ambient distributed state; it only sees this
//! interface. Single-worker training uses the identity implementation, so
//! the synchronized formulas collapse to their local counterparts.

mod rendezvous;

pub use rendezvous::CollectiveError;

use std::sync::Arc;

/// Blocking collective reductions across the worker group.
///
/// Both calls made by the assignment engine are synchronous barriers: every
/// worker must issue them at the same point of the same global step. A peer
/// failure is fatal to the whole group; there is no timeout or cancellation.
pub trait Collective: Send + Sync {
    /// Identifier of the current worker inside the group.
    fn rank(&self) -> usize;
    /// Total number of workers contributing to reductions.
    fn world_size(&self) -> usize;
    /// Sums `buffer` element-wise across all workers, in place.
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), CollectiveError>;
}

/// Identity collective for single-worker training.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl SingleProcess {
    pub fn new() -> Self {
        Self
    }
}

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<(), CollectiveError> {
        Ok(())
    }
}

/// Collective backed by an in-process rendezvous group, one member per thread.
///
/// Stands in for a multi-process reduction fabric in tests and single-host
/// multi-worker runs.
#[derive(Debug, Clone)]
pub struct ThreadCollective {
    member: Arc<rendezvous::Member>,
}

impl ThreadCollective {
    /// Joins the named rendezvous group as `rank` of `world_size` members.
    pub fn join(
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, CollectiveError> {
        let member = rendezvous::join(group.into(), rank, world_size)?;
        Ok(Self { member })
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.member.rank()
    }

    fn world_size(&self) -> usize {
        self.member.world_size()
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), CollectiveError> {
        rendezvous::all_reduce_sum(&self.member, buffer)
    }
}
