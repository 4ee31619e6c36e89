//! Database persistence layer for ForgeChain
//!
//! The node only needs an ordered key-value space per [`Namespace`] with
//! get/put/keys/iterate. [`Database`] backs it with SQLite, [`InMemoryStore`]
//! with a map. The typed views ([`Ledger`], [`BlockStore`]) JSON-encode values.
//!
//! No backend offers multi-key atomicity to callers; block replay accumulates
//! account changes in memory and flushes them only after the whole block passed.

use crate::blockchain::{Account, Block};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// address -> Account
    Accounts,
    /// block number -> Block
    Blocks,
    /// block hash -> block number
    BlockHashes,
    /// transaction hash -> TxLocation
    TransactionIndex,
    /// public key -> stake
    Stakes,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Accounts => "accounts",
            Namespace::Blocks => "blocks",
            Namespace::BlockHashes => "block_hashes",
            Namespace::TransactionIndex => "transaction_index",
            Namespace::Stakes => "stakes",
        }
    }
}

/// Abstraction for persistence backends.
///
/// `get` distinguishes an absent key (`Ok(None)`) from a backend failure (`Err`).
pub trait Store: Send + Sync {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<()>;
    fn keys(&self, namespace: Namespace) -> Result<Vec<String>>;
    fn iterate(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>>;
}

impl dyn Store {
    pub fn get_json<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                ChainError::DatabaseError(format!(
                    "Corrupt {} entry {}: {}",
                    namespace.as_str(),
                    key,
                    e
                ))
            }),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(namespace, key, &bytes)
    }
}

/// SQLite-backed store: a single `kv` table keyed by (namespace, key).
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for Database {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace.as_str(), key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| ChainError::DatabaseError(format!("Failed to read {}: {}", key, e)))
    }

    fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)",
            params![namespace.as_str(), key, value],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to write {}: {}", key, e)))?;
        Ok(())
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE namespace = ?1 ORDER BY key ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![namespace.as_str()], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query keys: {}", e)))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?);
        }
        Ok(keys)
    }

    fn iterate(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![namespace.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query entries: {}", e)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?);
        }
        Ok(entries)
    }
}

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<BTreeMap<(Namespace, String), Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&(namespace, key.to_string())).cloned())
    }

    fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .insert((namespace, key.to_string()), value.to_vec());
        Ok(())
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn iterate(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|((ns, _), _)| *ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Account balances and transaction lists, keyed by address.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn get_account(&self, address: &str) -> Result<Option<Account>> {
        self.store.get_json(Namespace::Accounts, address)
    }

    pub fn put_account(&self, account: &Account) -> Result<()> {
        self.store
            .put_json(Namespace::Accounts, &account.address, account)
    }

    pub fn contains(&self, address: &str) -> Result<bool> {
        Ok(self.store.get(Namespace::Accounts, address)?.is_some())
    }

    pub fn addresses(&self) -> Result<Vec<String>> {
        self.store.keys(Namespace::Accounts)
    }

    /// Creates the account with `balance` unless it already exists.
    pub fn ensure_account(&self, address: &str, balance: u64) -> Result<()> {
        if !self.contains(address)? {
            self.put_account(&Account::new(address.to_string(), balance))?;
        }
        Ok(())
    }
}

/// Where a transaction landed in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxLocation {
    pub block_number: u64,
    pub index: usize,
}

/// Blocks by number plus the hash and transaction indices derived from them.
#[derive(Clone)]
pub struct BlockStore {
    store: Arc<dyn Store>,
}

impl BlockStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn get_block(&self, number: u64) -> Result<Option<Block>> {
        self.store.get_json(Namespace::Blocks, &number.to_string())
    }

    /// Stores the block and its hash -> number and tx -> location indices.
    pub fn put_block(&self, block: &Block) -> Result<()> {
        let number = block.number.to_string();
        self.store.put_json(Namespace::Blocks, &number, block)?;
        self.store
            .put_json(Namespace::BlockHashes, &block.hash, &block.number)?;
        for (index, tx) in block.data.iter().enumerate() {
            let location = TxLocation {
                block_number: block.number,
                index,
            };
            self.store
                .put_json(Namespace::TransactionIndex, &tx.hash(), &location)?;
        }
        Ok(())
    }

    pub fn number_for_hash(&self, hash: &str) -> Result<Option<u64>> {
        self.store.get_json(Namespace::BlockHashes, hash)
    }

    pub fn location(&self, tx_hash: &str) -> Result<Option<TxLocation>> {
        self.store.get_json(Namespace::TransactionIndex, tx_hash)
    }

    /// Highest stored block number. Keys are decimal strings, so they are
    /// parsed rather than trusted for ordering.
    pub fn highest_number(&self) -> Result<Option<u64>> {
        Ok(self
            .store
            .keys(Namespace::Blocks)?
            .iter()
            .filter_map(|key| key.parse::<u64>().ok())
            .max())
    }

    pub fn latest_block(&self) -> Result<Option<Block>> {
        match self.highest_number()? {
            Some(number) => self.get_block(number),
            None => Ok(None),
        }
    }

    pub fn transaction(&self, tx_hash: &str) -> Result<Option<Transaction>> {
        let Some(location) = self.location(tx_hash)? else {
            return Ok(None);
        };
        Ok(self
            .get_block(location.block_number)?
            .and_then(|block| block.data.get(location.index).cloned()))
    }

    /// Follows `last_transaction_hash` links backwards from `tx_hash`, newest first.
    /// Stops at a missing link, a repeated hash, or after `max_depth` transactions.
    pub fn transaction_history(&self, tx_hash: &str, max_depth: usize) -> Result<Vec<Transaction>> {
        let mut history = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(tx_hash.to_string());

        while let Some(hash) = next.take() {
            if history.len() >= max_depth || !visited.insert(hash.clone()) {
                break;
            }
            let Some(tx) = self.transaction(&hash)? else {
                break;
            };
            next = tx.last_transaction_hash.clone();
            history.push(tx);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Block;
    use crate::transaction::{TransactionData, MINT_ADDRESS};

    fn exercise_store(store: Arc<dyn Store>) {
        assert_eq!(store.get(Namespace::Accounts, "missing").unwrap(), None);

        store.put(Namespace::Accounts, "b", b"2").unwrap();
        store.put(Namespace::Accounts, "a", b"1").unwrap();
        store.put(Namespace::Stakes, "a", b"9").unwrap();
        store.put(Namespace::Accounts, "a", b"3").unwrap();

        assert_eq!(store.get(Namespace::Accounts, "a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.keys(Namespace::Accounts).unwrap(), vec!["a", "b"]);
        assert_eq!(
            store.iterate(Namespace::Stakes).unwrap(),
            vec![("a".to_string(), b"9".to_vec())]
        );
    }

    #[test]
    fn test_in_memory_store() {
        exercise_store(Arc::new(InMemoryStore::new()));
    }

    #[test]
    fn test_sqlite_store() {
        exercise_store(Arc::new(Database::open(":memory:").unwrap()));
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        let path = path.to_str().unwrap();

        {
            let store: Arc<dyn Store> = Arc::new(Database::open(path).unwrap());
            Ledger::new(store).ensure_account("alice", 7).unwrap();
        }

        let store: Arc<dyn Store> = Arc::new(Database::open(path).unwrap());
        let account = Ledger::new(store).get_account("alice").unwrap().unwrap();
        assert_eq!(account.balance, 7);
    }

    #[test]
    fn test_ensure_account_does_not_overwrite() {
        let ledger = Ledger::new(Arc::new(InMemoryStore::new()));
        ledger.ensure_account("alice", 10).unwrap();
        ledger.ensure_account("alice", 99).unwrap();
        assert_eq!(ledger.get_account("alice").unwrap().unwrap().balance, 10);
    }

    #[test]
    fn test_block_indices_and_highest_number() {
        let blocks = BlockStore::new(Arc::new(InMemoryStore::new()));
        assert_eq!(blocks.highest_number().unwrap(), None);

        let genesis = Block::genesis();
        blocks.put_block(&genesis).unwrap();

        let tx = Transaction::new(
            MINT_ADDRESS.to_string(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 1 },
            None,
        );
        let mut block = Block::genesis();
        block.number = 10;
        block.hash = "ab".repeat(32);
        block.data = vec![tx.clone()];
        blocks.put_block(&block).unwrap();

        let mut block2 = block.clone();
        block2.number = 9;
        block2.hash = "cd".repeat(32);
        block2.data.clear();
        blocks.put_block(&block2).unwrap();

        // "10" sorts before "9" as a string
        assert_eq!(blocks.highest_number().unwrap(), Some(10));
        assert_eq!(blocks.number_for_hash(&block.hash).unwrap(), Some(10));
        assert_eq!(
            blocks.location(&tx.hash()).unwrap(),
            Some(TxLocation {
                block_number: 10,
                index: 0
            })
        );
        assert_eq!(blocks.transaction(&tx.hash()).unwrap(), Some(tx));
    }

    #[test]
    fn test_transaction_history_walks_links_and_stops_on_cycle() {
        let blocks = BlockStore::new(Arc::new(InMemoryStore::new()));

        let first = Transaction::new(
            "alice".to_string(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 1 },
            None,
        );
        let second = Transaction::new(
            "alice".to_string(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 2 },
            Some(first.hash()),
        );
        let third = Transaction::new(
            "alice".to_string(),
            "carol".to_string(),
            TransactionData::Purchase { amount: 3 },
            Some(second.hash()),
        );

        let mut block = Block::genesis();
        block.number = 2;
        block.data = vec![first.clone(), second.clone(), third.clone()];
        blocks.put_block(&block).unwrap();

        let history = blocks.transaction_history(&third.hash(), 10).unwrap();
        assert_eq!(history, vec![third.clone(), second.clone(), first.clone()]);

        let capped = blocks.transaction_history(&third.hash(), 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_transaction_history_stops_on_malformed_cycle() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let blocks = BlockStore::new(store.clone());

        let a = Transaction::new(
            "mallory".to_string(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 1 },
            Some("hash-b".to_string()),
        );
        let b = Transaction::new(
            "mallory".to_string(),
            "bob".to_string(),
            TransactionData::Purchase { amount: 2 },
            Some("hash-a".to_string()),
        );
        let mut block = Block::genesis();
        block.number = 3;
        block.data = vec![a.clone(), b.clone()];
        store.put_json(Namespace::Blocks, "3", &block).unwrap();
        store
            .put_json(
                Namespace::TransactionIndex,
                "hash-a",
                &TxLocation {
                    block_number: 3,
                    index: 0,
                },
            )
            .unwrap();
        store
            .put_json(
                Namespace::TransactionIndex,
                "hash-b",
                &TxLocation {
                    block_number: 3,
                    index: 1,
                },
            )
            .unwrap();

        let history = blocks.transaction_history("hash-a", 100).unwrap();
        assert_eq!(history, vec![a, b]);
    }
}
