//! Rank bookkeeping for data-parallel training.
//!
//! Every worker holds a full model replica and a disjoint shard of the data.
//! A process group only answers "who am I and how many of us are there".

/// Trait for process group operations.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this worker (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of workers in the group.
    fn world_size(&self) -> usize;

    /// Local rank on this node.
    fn local_rank(&self) -> usize;

    /// Whether this is the coordinator (rank 0). Only the coordinator writes
    /// event logs.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Process group with a fixed rank, for single-worker runs and for the
/// workers of an in-process thread group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pg_is_single_coordinator() {
        let pg = LocalProcessGroup::new();
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
        assert_eq!(pg.local_rank(), 0);
    }

    #[test]
    fn local_pg_with_rank() {
        let pg = LocalProcessGroup::with_rank(2, 4);
        assert_eq!(pg.rank(), 2);
        assert_eq!(pg.world_size(), 4);
        assert!(!pg.is_coordinator());
        assert!(!pg.is_single());
    }

    #[test]
    #[should_panic(expected = "rank must be < world_size")]
    fn local_pg_invalid_rank_panics() {
        LocalProcessGroup::with_rank(5, 4);
    }
}
