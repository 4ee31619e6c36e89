use crate::error::Result;
use crate::persistence::Ledger;
use tracing::debug;

use super::chain::{now_millis, Block};
use super::state::verify_tx_and_transit;

/// Full acceptance check for a candidate block on top of `latest_block`.
///
/// Every structural check runs before the ledger is touched. The ledger replay
/// is last and itself all-or-nothing, so `Ok(false)` never leaves side effects.
///
/// The timestamp must be later than the parent's and not in the future; a
/// block stamped in the current millisecond is accepted.
pub fn verify_block(block: &Block, latest_block: &Block, ledger: &Ledger) -> Result<bool> {
    if block.hash != block.recompute_hash() {
        debug!(number = block.number, "hash does not match contents");
        return Ok(false);
    }

    if block.last_hash != latest_block.hash {
        debug!(
            number = block.number,
            last_hash = %block.last_hash,
            head = %latest_block.hash,
            "block does not extend the current head"
        );
        return Ok(false);
    }

    if block.difficulty < 1 || (block.difficulty - latest_block.difficulty).abs() > 1 {
        debug!(
            number = block.number,
            difficulty = block.difficulty,
            parent = latest_block.difficulty,
            "difficulty out of range"
        );
        return Ok(false);
    }

    if !block.meets_difficulty() {
        debug!(number = block.number, difficulty = block.difficulty, "proof of work too weak");
        return Ok(false);
    }

    if !block.data.iter().all(|tx| tx.is_valid()) {
        debug!(number = block.number, "block carries an invalid transaction");
        return Ok(false);
    }

    if block.timestamp <= latest_block.timestamp || block.timestamp > now_millis() {
        debug!(number = block.number, timestamp = block.timestamp, "timestamp out of range");
        return Ok(false);
    }

    if block.number.checked_sub(1) != Some(latest_block.number) {
        debug!(number = block.number, head = latest_block.number, "block number out of sequence");
        return Ok(false);
    }

    verify_tx_and_transit(block, ledger)
}
