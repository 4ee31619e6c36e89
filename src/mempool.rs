//! Pending transaction pool
//!
//! Transactions are identified by signature. Mint transactions carry none and
//! fall back to their hash.

use crate::error::Result;
use crate::persistence::Ledger;
use crate::transaction::{Transaction, TransactionData};
use std::collections::HashSet;
use tracing::debug;

fn identity(tx: &Transaction) -> String {
    tx.signature.clone().unwrap_or_else(|| tx.hash())
}

/// Entries of `pool` not included in `included`, original order kept.
pub fn clear_depreciated_transactions(
    pool: &[Transaction],
    included: &[Transaction],
) -> Vec<Transaction> {
    let included: HashSet<String> = included.iter().map(identity).collect();
    pool.iter()
        .filter(|tx| !included.contains(&identity(tx)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn has_pending_credit(&self, address: &str) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.to == address && matches!(tx.data, TransactionData::Purchase { .. }))
    }

    /// Admits `tx` if it is valid, its sender is known (in the ledger or
    /// through a pending purchase to it) and it is not already pooled.
    /// Rewards are never pooled; the forger synthesizes its own.
    pub fn add_transaction(&mut self, tx: Transaction, ledger: &Ledger) -> Result<bool> {
        if tx.data.is_reward() || !tx.is_valid() {
            debug!(tx = %tx.hash(), "pool rejected invalid transaction");
            return Ok(false);
        }

        if !ledger.contains(&tx.from)? && !self.has_pending_credit(&tx.from) {
            debug!(from = %tx.from, "pool rejected transaction from unknown sender");
            return Ok(false);
        }

        let id = identity(&tx);
        if self.transactions.iter().rev().any(|pooled| identity(pooled) == id) {
            return Ok(false);
        }

        self.transactions.push(tx);
        Ok(true)
    }

    /// Replaces the pool with the entries of `incoming` that pass admission,
    /// checked in order so a purchase earlier in `incoming` can admit its
    /// recipient's spends.
    pub fn replace(&mut self, incoming: Vec<Transaction>, ledger: &Ledger) -> Result<usize> {
        let before = incoming.len();
        self.transactions.clear();
        for tx in incoming {
            self.add_transaction(tx, ledger)?;
        }
        if self.transactions.len() != before {
            debug!(dropped = before - self.transactions.len(), "dropped pooled transactions that failed admission");
        }
        Ok(self.transactions.len())
    }

    /// Drops everything `included` in an accepted block.
    pub fn prune(&mut self, included: &[Transaction]) {
        self.transactions = clear_depreciated_transactions(&self.transactions, included);
    }
}
