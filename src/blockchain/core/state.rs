use crate::error::Result;
use crate::persistence::Ledger;
use crate::transaction::TransactionData;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::chain::Block;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    pub balance: u64,
    #[serde(default)]
    pub incoming_transactions: Vec<String>,
    #[serde(default)]
    pub outgoing_transactions: Vec<String>,
}

impl Account {
    pub fn new(address: String, balance: u64) -> Self {
        Self {
            address,
            balance,
            incoming_transactions: Vec::new(),
            outgoing_transactions: Vec::new(),
        }
    }
}

/// Account changes accumulated in memory. Nothing reaches the ledger until
/// [`LedgerDiff::commit`]; dropping the diff discards every change.
pub struct LedgerDiff<'a> {
    ledger: &'a Ledger,
    accounts: BTreeMap<String, Account>,
}

impl<'a> LedgerDiff<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self {
            ledger,
            accounts: BTreeMap::new(),
        }
    }

    /// Pulls the account into the diff; `false` if it exists nowhere.
    fn load(&mut self, address: &str) -> Result<bool> {
        if self.accounts.contains_key(address) {
            return Ok(true);
        }
        match self.ledger.get_account(address)? {
            Some(account) => {
                self.accounts.insert(address.to_string(), account);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn balance(&mut self, address: &str) -> Result<Option<u64>> {
        if !self.load(address)? {
            return Ok(None);
        }
        Ok(self.accounts.get(address).map(|a| a.balance))
    }

    /// Debits `amount`; `false` when the account is missing or short.
    pub fn debit(&mut self, address: &str, amount: u64) -> Result<bool> {
        if !self.load(address)? {
            return Ok(false);
        }
        match self.accounts.get_mut(address) {
            Some(account) if account.balance >= amount => {
                account.balance -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Credits `amount`, opening a zero-balance account first if needed.
    pub fn credit(&mut self, address: &str, amount: u64) -> Result<()> {
        if !self.load(address)? {
            self.accounts
                .insert(address.to_string(), Account::new(address.to_string(), 0));
        }
        if let Some(account) = self.accounts.get_mut(address) {
            account.balance = account.balance.saturating_add(amount);
        }
        Ok(())
    }

    pub fn record_outgoing(&mut self, address: &str, tx_hash: &str) -> Result<()> {
        if self.load(address)? {
            if let Some(account) = self.accounts.get_mut(address) {
                account.outgoing_transactions.push(tx_hash.to_string());
            }
        }
        Ok(())
    }

    pub fn record_incoming(&mut self, address: &str, tx_hash: &str) -> Result<()> {
        if self.load(address)? {
            if let Some(account) = self.accounts.get_mut(address) {
                account.incoming_transactions.push(tx_hash.to_string());
            }
        }
        Ok(())
    }

    /// Writes every touched account to the ledger.
    pub fn commit(self) -> Result<()> {
        for account in self.accounts.values() {
            self.ledger.put_account(account)?;
        }
        Ok(())
    }
}

/// Checks every transaction of `block` and replays it against `ledger`.
///
/// The first transaction is the producer reward and credits its recipient with
/// one unit per other transaction in the block. Stakes and purchases debit the
/// sender; purchases credit the recipient. Every non-reward transaction is
/// appended to the sender's outgoing and the recipient's incoming list.
///
/// A transaction may appear only once per block.
///
/// Returns `Ok(false)` on any rejection, in which case the ledger is untouched.
pub fn verify_tx_and_transit(block: &Block, ledger: &Ledger) -> Result<bool> {
    let Some((reward, rest)) = block.data.split_first() else {
        debug!(number = block.number, "block carries no reward transaction");
        return Ok(false);
    };

    if !reward.data.is_reward() || rest.iter().any(|tx| tx.data.is_reward()) {
        debug!(number = block.number, "reward transaction missing or misplaced");
        return Ok(false);
    }

    if let Some(tx) = block.data.iter().find(|tx| !tx.is_valid()) {
        debug!(number = block.number, tx = %tx.hash(), "block carries an invalid transaction");
        return Ok(false);
    }

    let mut hashes = HashSet::new();
    if let Some(tx) = block.data.iter().find(|tx| !hashes.insert(tx.hash())) {
        debug!(number = block.number, tx = %tx.hash(), "transaction appears twice in block");
        return Ok(false);
    }

    let senders: HashSet<&str> = block
        .data
        .iter()
        .filter(|tx| !tx.is_mint())
        .map(|tx| tx.from.as_str())
        .collect();
    for sender in senders {
        if !ledger.contains(sender)? {
            debug!(number = block.number, sender, "unknown sender");
            return Ok(false);
        }
    }

    let mut diff = LedgerDiff::new(ledger);
    diff.credit(&reward.to, rest.len() as u64)?;

    for tx in rest {
        let hash = tx.hash();
        match &tx.data {
            TransactionData::Stake { amount } => {
                if !diff.debit(&tx.from, *amount)? {
                    debug!(tx = %hash, "insufficient balance for stake");
                    return Ok(false);
                }
            }
            TransactionData::Purchase { amount } => {
                if !diff.debit(&tx.from, *amount)? {
                    debug!(tx = %hash, "insufficient balance for purchase");
                    return Ok(false);
                }
                diff.credit(&tx.to, *amount)?;
            }
            TransactionData::Record { .. } | TransactionData::MiningReward { .. } => {}
        }

        diff.record_outgoing(&tx.from, &hash)?;
        diff.record_incoming(&tx.to, &hash)?;
    }

    diff.commit()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryStore;
    use crate::transaction::Transaction;
    use std::sync::Arc;

    struct Fixture {
        ledger: Ledger,
        forger: KeyPair,
        alice: KeyPair,
    }

    fn fixture() -> Fixture {
        let ledger = Ledger::new(Arc::new(InMemoryStore::new()));
        let forger = KeyPair::generate();
        let alice = KeyPair::generate();
        ledger.ensure_account(&forger.address(), 0).unwrap();
        ledger.ensure_account(&alice.address(), 100).unwrap();
        Fixture {
            ledger,
            forger,
            alice,
        }
    }

    fn signed(from: &KeyPair, to: &str, data: TransactionData) -> Transaction {
        let mut tx = Transaction::new(from.address(), to.to_string(), data, None);
        tx.sign(from).unwrap();
        tx
    }

    fn reward(forger: &KeyPair, included: &[Transaction]) -> Transaction {
        signed(
            forger,
            "reward-address",
            TransactionData::MiningReward {
                included_transaction_hashes: included.iter().map(|t| t.hash()).collect(),
            },
        )
    }

    fn block_with(data: Vec<Transaction>) -> Block {
        Block {
            number: 2,
            data,
            ..Block::genesis()
        }
    }

    fn snapshot(ledger: &Ledger) -> Vec<Account> {
        ledger
            .addresses()
            .unwrap()
            .iter()
            .map(|a| ledger.get_account(a).unwrap().unwrap())
            .collect()
    }

    #[test]
    fn test_purchase_moves_balance_and_pays_reward() {
        let f = fixture();
        let purchase = signed(&f.alice, "bob", TransactionData::Purchase { amount: 30 });
        let stake = signed(&f.alice, "pool", TransactionData::Stake { amount: 20 });
        let txs = vec![purchase.clone(), stake.clone()];
        let mut data = vec![reward(&f.forger, &txs)];
        data.extend(txs);

        assert!(verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());

        let alice = f.ledger.get_account(&f.alice.address()).unwrap().unwrap();
        assert_eq!(alice.balance, 50);
        assert_eq!(alice.outgoing_transactions, vec![purchase.hash(), stake.hash()]);

        let bob = f.ledger.get_account("bob").unwrap().unwrap();
        assert_eq!(bob.balance, 30);
        assert_eq!(bob.incoming_transactions, vec![purchase.hash()]);

        // reward is the count of non-reward transactions
        let rewarded = f.ledger.get_account("reward-address").unwrap().unwrap();
        assert_eq!(rewarded.balance, 2);

        // a stake recipient that does not exist is not created
        assert!(!f.ledger.contains("pool").unwrap());
    }

    #[test]
    fn test_unsigned_transaction_rejected_without_side_effects() {
        let f = fixture();
        let before = snapshot(&f.ledger);

        let unsigned = Transaction::new(
            f.alice.address(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 10 },
            None,
        );
        let data = vec![reward(&f.forger, &[unsigned.clone()]), unsigned];

        assert!(!verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());
        assert_eq!(snapshot(&f.ledger), before);
    }

    #[test]
    fn test_signature_mismatch_rejected() {
        let f = fixture();
        let before = snapshot(&f.ledger);

        let mut tampered = signed(&f.alice, "bob", TransactionData::Purchase { amount: 10 });
        tampered.data = TransactionData::Purchase { amount: 90 };
        let data = vec![reward(&f.forger, &[tampered.clone()]), tampered];

        assert!(!verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());
        assert_eq!(snapshot(&f.ledger), before);
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let f = fixture();
        let stranger = KeyPair::generate();
        let tx = signed(&stranger, "bob", TransactionData::Record {
            kind: "PRODUCT".to_string(),
            payload: "{}".to_string(),
        });
        let data = vec![reward(&f.forger, &[tx.clone()]), tx];

        assert!(!verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());
        assert!(!f.ledger.contains(&stranger.address()).unwrap());
    }

    #[test]
    fn test_insufficient_balance_rolls_back_whole_block() {
        let f = fixture();
        let before = snapshot(&f.ledger);

        let ok = signed(&f.alice, "bob", TransactionData::Purchase { amount: 60 });
        let too_much = signed(&f.alice, "carol", TransactionData::Purchase { amount: 60 });
        let txs = vec![ok, too_much];
        let mut data = vec![reward(&f.forger, &txs)];
        data.extend(txs);

        assert!(!verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());
        assert_eq!(snapshot(&f.ledger), before);
        assert!(!f.ledger.contains("bob").unwrap());
    }

    #[test]
    fn test_repeated_transaction_rejects_block() {
        let f = fixture();
        let before = snapshot(&f.ledger);

        let spend = signed(&f.alice, "bob", TransactionData::Purchase { amount: 30 });
        let txs = vec![spend.clone(), spend.clone(), spend];
        let mut data = vec![reward(&f.forger, &txs)];
        data.extend(txs);

        assert!(!verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());
        assert_eq!(snapshot(&f.ledger), before);
        let alice = f.ledger.get_account(&f.alice.address()).unwrap().unwrap();
        assert_eq!(alice.balance, 100);
    }

    #[test]
    fn test_reward_must_lead_the_block() {
        let f = fixture();
        let purchase = signed(&f.alice, "bob", TransactionData::Purchase { amount: 1 });
        let data = vec![purchase.clone(), reward(&f.forger, &[purchase])];
        assert!(!verify_tx_and_transit(&block_with(data), &f.ledger).unwrap());
        assert!(!verify_tx_and_transit(&block_with(Vec::new()), &f.ledger).unwrap());
    }

    #[test]
    fn test_diff_discarded_when_dropped() {
        let f = fixture();
        {
            let mut diff = LedgerDiff::new(&f.ledger);
            assert!(diff.debit(&f.alice.address(), 100).unwrap());
            assert_eq!(diff.balance(&f.alice.address()).unwrap(), Some(0));
            assert!(!diff.debit(&f.alice.address(), 1).unwrap());
        }
        let alice = f.ledger.get_account(&f.alice.address()).unwrap().unwrap();
        assert_eq!(alice.balance, 100);
    }
}
