use crate::crypto_hash;
use crate::hasher::leading_zero_bits;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Target time between blocks. Faster blocks raise difficulty, slower ones lower it.
pub const MINE_RATE_MS: u64 = 1_000;
pub const INITIAL_DIFFICULTY: i64 = 3;

pub const GENESIS_TIMESTAMP: u64 = 1_672_531_200_000;
pub const GENESIS_LAST_HASH: &str = "-----";
pub const GENESIS_HASH: &str = "f1c0a3e5b27d4c9e8a61f0d2b3c4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f6";

/// Nonces tried between checks of the cancel flag.
const CANCEL_CHECK_INTERVAL: u64 = 1_024;

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub timestamp: u64,
    pub last_hash: String,
    pub hash: String,
    pub data: Vec<Transaction>,
    pub difficulty: i64,
    pub nonce: u64,
}

impl Block {
    /// The hard-coded first block every node starts from.
    pub fn genesis() -> Block {
        Block {
            number: 1,
            timestamp: GENESIS_TIMESTAMP,
            last_hash: GENESIS_LAST_HASH.to_string(),
            hash: GENESIS_HASH.to_string(),
            data: Vec::new(),
            difficulty: INITIAL_DIFFICULTY,
            nonce: 0,
        }
    }

    pub fn is_genesis(&self) -> bool {
        *self == Block::genesis()
    }

    pub fn calculate_hash(
        timestamp: u64,
        last_hash: &str,
        data: &[Transaction],
        nonce: u64,
        difficulty: i64,
    ) -> String {
        crypto_hash!(timestamp, last_hash, data, nonce, difficulty)
    }

    pub fn recompute_hash(&self) -> String {
        Self::calculate_hash(
            self.timestamp,
            &self.last_hash,
            &self.data,
            self.nonce,
            self.difficulty,
        )
    }

    /// Legacy proof-of-work check: the hash has at least `difficulty` leading zero bits.
    pub fn meets_difficulty(&self) -> bool {
        i64::from(leading_zero_bits(&self.hash)) >= self.difficulty
    }

    /// Difficulty for a block following `original_block` and stamped at `timestamp`.
    pub fn adjust_difficulty(original_block: &Block, timestamp: u64) -> i64 {
        let difficulty = original_block.difficulty;
        if difficulty < 1 {
            return 1;
        }

        if timestamp.saturating_sub(original_block.timestamp) > MINE_RATE_MS {
            (difficulty - 1).max(1)
        } else {
            difficulty + 1
        }
    }

    pub fn mine_block(last_block: &Block, data: Vec<Transaction>) -> Block {
        let mut nonce: u64 = 0;
        loop {
            nonce += 1;
            if let Some(block) = Self::try_nonce(last_block, &data, nonce) {
                return block;
            }
        }
    }

    /// Proof-of-work search. Returns `None` once `cancel` is raised.
    pub fn mine_block_cancellable(
        last_block: &Block,
        data: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Option<Block> {
        let mut nonce: u64 = 0;
        loop {
            nonce += 1;
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(block) = Self::try_nonce(last_block, &data, nonce) {
                return Some(block);
            }
        }
    }

    fn try_nonce(last_block: &Block, data: &[Transaction], nonce: u64) -> Option<Block> {
        let timestamp = now_millis().max(last_block.timestamp + 1);
        let difficulty = Self::adjust_difficulty(last_block, timestamp);
        let hash = Self::calculate_hash(timestamp, &last_block.hash, data, nonce, difficulty);

        if i64::from(leading_zero_bits(&hash)) < difficulty {
            return None;
        }
        Some(Block {
            number: last_block.number + 1,
            timestamp,
            last_hash: last_block.hash.clone(),
            hash,
            data: data.to_vec(),
            difficulty,
            nonce,
        })
    }

    /// Full-chain check kept from the proof-of-work era: genesis match, linkage,
    /// recomputed hashes, sequential numbers and difficulty steps of at most one.
    pub fn is_valid_chain(chain: &[Block]) -> bool {
        match chain.first() {
            Some(first) if first.is_genesis() => {}
            _ => return false,
        }

        chain.windows(2).all(|pair| {
            let (previous, block) = (&pair[0], &pair[1]);
            block.last_hash == previous.hash
                && block.number == previous.number + 1
                && block.hash == block.recompute_hash()
                && (block.difficulty - previous.difficulty).abs() <= 1
        })
    }
}
