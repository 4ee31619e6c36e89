//! Chain catch-up for ForgeChain
//!
//! A catching-up node asks its peers for one block number at a time and
//! applies the answers strictly in order through a [`SyncQueue`].

use crate::blockchain::Block;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    CatchingUp,
    Synced,
}

/// Single-concurrency admission for blocks fetched during catch-up.
///
/// `add` hands a block back only when nothing is in flight; later blocks wait
/// in submission order until [`SyncQueue::wipe`] releases the slot.
#[derive(Debug, Default)]
pub struct SyncQueue {
    in_flight: bool,
    queued: VecDeque<Block>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the block to apply now, or `None` if it was queued.
    pub fn add(&mut self, block: Block) -> Option<Block> {
        if self.in_flight {
            self.queued.push_back(block);
            return None;
        }
        self.in_flight = true;
        Some(block)
    }

    /// Marks the running job finished and hands out the next queued block.
    pub fn wipe(&mut self) -> Option<Block> {
        match self.queued.pop_front() {
            Some(next) => Some(next),
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    /// Forgets queued blocks and frees the slot.
    pub fn clear(&mut self) {
        self.queued.clear();
        self.in_flight = false;
    }
}

/// Where catch-up stands: the state plus the next block number wanted.
#[derive(Debug, Clone)]
pub struct CatchUp {
    state: SyncState,
    expected: Option<u64>,
}

impl CatchUp {
    /// `highest` is the highest locally stored block number, if any.
    pub fn new(enabled: bool, highest: Option<u64>) -> Self {
        if !enabled {
            return CatchUp {
                state: SyncState::Synced,
                expected: None,
            };
        }
        CatchUp {
            state: SyncState::CatchingUp,
            expected: Some(highest.map_or(1, |n| n + 1)),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_catching_up(&self) -> bool {
        self.state == SyncState::CatchingUp
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn expects(&self, number: u64) -> bool {
        self.expected == Some(number)
    }

    /// Moves past a block that was applied. Returns the next number to request.
    pub fn advance(&mut self, applied: u64) -> Option<u64> {
        if let Some(expected) = self.expected {
            if applied >= expected {
                self.expected = Some(applied + 1);
            }
        }
        self.expected
    }

    pub fn mark_synced(&mut self) {
        self.state = SyncState::Synced;
    }
}
