// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of swav-rs — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use thiserror::Error;

static GROUPS: Lazy<Mutex<HashMap<String, Weak<Group>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Errors produced by the in-process rendezvous implementation.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CollectiveError {
    #[error("world size must be positive, got {0}")]
    EmptyWorldSize(usize),
    #[error("rank {rank} is out of bounds for world size {world_size}")]
    RankOutOfBounds { rank: usize, world_size: usize },
    #[error("rendezvous group expects world size {expected}, got {got}")]
    WorldSizeMismatch { expected: usize, got: usize },
    #[error("rank {rank} already joined rendezvous group")]
    DuplicateRank { rank: usize },
    #[error("reduce buffer length mismatch: expected {expected}, got {got}")]
    BufferLengthMismatch { expected: usize, got: usize },
}

#[derive(Debug)]
struct Group {
    round: Mutex<Round>,
    barrier: Condvar,
}

#[derive(Debug, Default)]
struct Round {
    expected: usize,
    arrived: usize,
    generation: u64,
    accumulator: Vec<f32>,
    reduced: Vec<f32>,
    published_generation: u64,
    members: HashSet<usize>,
    fault: Option<CollectiveError>,
}

/// Handle representing one worker's membership in a rendezvous group.
#[derive(Debug)]
pub struct Member {
    group: Arc<Group>,
    group_name: String,
    rank: usize,
    world_size: usize,
}

impl Member {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        {
            let mut round = self
                .group
                .round
                .lock()
                .expect("rendezvous round lock should not be poisoned");
            round.members.remove(&self.rank);
            if round.members.is_empty() {
                *round = Round::default();
            }
        }

        let mut groups = GROUPS
            .lock()
            .expect("rendezvous registry lock should not be poisoned");
        let stale = groups
            .get(&self.group_name)
            .map(|weak| weak.upgrade().is_none())
            .unwrap_or(false);
        if stale {
            groups.remove(&self.group_name);
        }
    }
}

/// Connects a worker to the named rendezvous group.
pub fn join(group: String, rank: usize, world_size: usize) -> Result<Arc<Member>, CollectiveError> {
    if world_size == 0 {
        return Err(CollectiveError::EmptyWorldSize(world_size));
    }
    if rank >= world_size {
        return Err(CollectiveError::RankOutOfBounds { rank, world_size });
    }

    let shared = {
        let mut groups = GROUPS
            .lock()
            .expect("rendezvous registry lock should not be poisoned");
        let entry = groups.entry(group.clone()).or_insert_with(Weak::new);
        if let Some(existing) = entry.upgrade() {
            existing
        } else {
            let created = Arc::new(Group {
                round: Mutex::new(Round::default()),
                barrier: Condvar::new(),
            });
            *entry = Arc::downgrade(&created);
            created
        }
    };

    {
        let mut round = shared
            .round
            .lock()
            .expect("rendezvous round lock should not be poisoned");
        if round.expected == 0 {
            round.expected = world_size;
        } else if round.expected != world_size {
            return Err(CollectiveError::WorldSizeMismatch {
                expected: round.expected,
                got: world_size,
            });
        }
        if !round.members.insert(rank) {
            return Err(CollectiveError::DuplicateRank { rank });
        }
    }

    Ok(Arc::new(Member {
        group: shared,
        group_name: group,
        rank,
        world_size,
    }))
}

/// Element-wise sum across the group; blocks until every member arrives.
///
/// A buffer-length mismatch poisons the round for every member: the fault is
/// published and all waiters observe it, matching the fatal-to-the-group
/// failure model of the training harness.
pub fn all_reduce_sum(member: &Arc<Member>, buffer: &mut [f32]) -> Result<(), CollectiveError> {
    let group = &member.group;
    let mut round = group
        .round
        .lock()
        .expect("rendezvous round lock should not be poisoned");

    if round.arrived == 0 {
        round.generation = round.generation.wrapping_add(1);
        round.accumulator.clear();
        round.accumulator.resize(buffer.len(), 0.0);
        round.fault = None;
    } else if round.accumulator.len() != buffer.len() {
        let fault = CollectiveError::BufferLengthMismatch {
            expected: round.accumulator.len(),
            got: buffer.len(),
        };
        round.arrived = 0;
        round.published_generation = round.generation;
        round.fault = Some(fault.clone());
        group.barrier.notify_all();
        return Err(fault);
    }

    for (sum, value) in round.accumulator.iter_mut().zip(buffer.iter()) {
        *sum += *value;
    }

    round.arrived += 1;
    let generation = round.generation;

    if round.arrived == round.expected {
        round.reduced = round.accumulator.clone();
        round.arrived = 0;
        round.published_generation = generation;
        group.barrier.notify_all();
    } else {
        while round.published_generation != generation {
            round = group
                .barrier
                .wait(round)
                .expect("rendezvous round lock should not be poisoned");
        }
    }

    if let Some(fault) = round.fault.clone() {
        return Err(fault);
    }

    buffer.copy_from_slice(&round.reduced);
    Ok(())
}
