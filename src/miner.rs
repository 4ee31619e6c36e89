//! Block production for ForgeChain
//!
//! Candidate selection and the reward transaction are computed on the node
//! loop. The proof-of-work search runs on a dedicated worker thread that takes
//! jobs from a channel and reports back on the node's event channel. A worker
//! is never interrupted in place: it is killed (cancel flag plus dropped job
//! channel) and replaced by a fresh one with a new generation number, and
//! results from older generations are ignored.

use crate::blockchain::{Block, LedgerDiff};
use crate::crypto::KeyPair;
use crate::error::{ChainError, Result};
use crate::persistence::Ledger;
use crate::transaction::{Transaction, TransactionData};
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Pool entries that would replay cleanly, in pool order.
///
/// Uses the same balance rules as block replay but skips a transaction whose
/// sender cannot pay instead of failing the whole candidate. Senders must
/// already be in the ledger, since replay checks that before applying anything.
pub fn select_transactions(pool: &[Transaction], ledger: &Ledger) -> Result<Vec<Transaction>> {
    let mut diff = LedgerDiff::new(ledger);
    let mut known = HashSet::new();
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for tx in pool {
        if tx.data.is_reward() || !tx.is_valid() {
            continue;
        }
        if !seen.insert(tx.hash()) {
            debug!(tx = %tx.hash(), "skipping repeated transaction");
            continue;
        }
        if !known.contains(&tx.from) {
            if !ledger.contains(&tx.from)? {
                debug!(from = %tx.from, "skipping transaction from unknown sender");
                continue;
            }
            known.insert(tx.from.clone());
        }

        match &tx.data {
            TransactionData::Stake { amount } => {
                if !diff.debit(&tx.from, *amount)? {
                    debug!(tx = %tx.hash(), "skipping insolvent stake");
                    continue;
                }
            }
            TransactionData::Purchase { amount } => {
                if !diff.debit(&tx.from, *amount)? {
                    debug!(tx = %tx.hash(), "skipping insolvent purchase");
                    continue;
                }
                diff.credit(&tx.to, *amount)?;
            }
            TransactionData::Record { .. } | TransactionData::MiningReward { .. } => {}
        }
        selected.push(tx.clone());
    }
    Ok(selected)
}

/// The producer's reward, signed by the forger and listing what it includes.
pub fn build_reward(
    forger: &KeyPair,
    reward_address: &str,
    included: &[Transaction],
) -> Result<Transaction> {
    let mut reward = Transaction::new(
        forger.address(),
        reward_address.to_string(),
        TransactionData::MiningReward {
            included_transaction_hashes: included.iter().map(Transaction::hash).collect(),
        },
        None,
    );
    reward.sign(forger)?;
    Ok(reward)
}

struct MiningJob {
    parent: Block,
    data: Vec<Transaction>,
}

/// What a worker reports. `block` is `None` when the search was cancelled.
#[derive(Debug)]
pub struct MiningResult {
    pub generation: u64,
    pub block: Option<Block>,
}

/// Handle to one proof-of-work thread.
pub struct MinerWorker {
    generation: u64,
    jobs: Sender<MiningJob>,
    cancel: Arc<AtomicBool>,
    _thread: JoinHandle<()>,
}

impl MinerWorker {
    pub fn spawn(generation: u64, results: mpsc::UnboundedSender<MiningResult>) -> Result<Self> {
        let (jobs, job_rx) = unbounded::<MiningJob>();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();

        let thread = thread::Builder::new()
            .name(format!("forgechain-miner-{}", generation))
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let block = Block::mine_block_cancellable(&job.parent, job.data, &flag);
                    if results.send(MiningResult { generation, block }).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| ChainError::WorkerError(format!("failed to start miner thread: {}", e)))?;

        Ok(MinerWorker {
            generation,
            jobs,
            cancel,
            _thread: thread,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn submit(&self, parent: Block, data: Vec<Transaction>) -> Result<()> {
        self.jobs
            .send(MiningJob { parent, data })
            .map_err(|_| ChainError::WorkerError("miner thread is gone".to_string()))
    }

    /// Stops the search and detaches the thread. It notices the flag within
    /// a few thousand nonces and exits once the job channel is closed.
    pub fn kill(self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Owns at most one worker plus the bookkeeping for the round it works on.
pub struct Miner {
    results: mpsc::UnboundedSender<MiningResult>,
    worker: Option<MinerWorker>,
    next_generation: u64,
    height: Option<u64>,
    raced: bool,
}

impl Miner {
    pub fn new(results: mpsc::UnboundedSender<MiningResult>) -> Self {
        Miner {
            results,
            worker: None,
            next_generation: 1,
            height: None,
            raced: false,
        }
    }

    pub fn is_mining(&self) -> bool {
        self.height.is_some()
    }

    /// Height of the block being searched for, if any.
    pub fn height(&self) -> Option<u64> {
        self.height
    }

    pub fn raced(&self) -> bool {
        self.raced
    }

    fn worker(&mut self) -> Result<&MinerWorker> {
        if self.worker.is_none() {
            let generation = self.next_generation;
            self.next_generation += 1;
            self.worker = Some(MinerWorker::spawn(generation, self.results.clone())?);
        }
        self.worker
            .as_ref()
            .ok_or_else(|| ChainError::WorkerError("no miner thread".to_string()))
    }

    pub fn start(&mut self, parent: Block, data: Vec<Transaction>) -> Result<()> {
        let height = parent.number + 1;
        self.worker()?.submit(parent, data)?;
        self.height = Some(height);
        self.raced = false;
        info!(height, "mining started");
        Ok(())
    }

    /// A competing block took `height`: drop the current search.
    pub fn race_lost(&mut self, height: u64) {
        if self.height == Some(height) {
            self.raced = true;
            self.respawn();
        }
    }

    /// Kills the current worker. The next [`Miner::start`] gets a fresh one.
    pub fn respawn(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(generation = worker.generation(), "miner worker killed");
            worker.kill();
        }
    }

    /// Closes the round `result` belongs to. Returns the block only if it is
    /// from the current worker and no competing block won the race.
    pub fn finish(&mut self, result: MiningResult) -> Option<Block> {
        let current = self.worker.as_ref().map(MinerWorker::generation);
        if current.is_some() && current != Some(result.generation) {
            debug!(generation = result.generation, "ignoring result from a replaced worker");
            return None;
        }
        if current.is_none() && !self.raced {
            return None;
        }

        let raced = self.raced;
        self.height = None;
        self.raced = false;
        self.respawn();

        if raced {
            debug!(generation = result.generation, "discarding raced mining result");
            return None;
        }
        result.block
    }
}
