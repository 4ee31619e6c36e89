//! Transaction types and their wire format
use crate::crypto::KeyPair;
use crate::crypto_hash;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Sender address of supply-issuing transactions. These carry no signature.
pub const MINT_ADDRESS: &str = "MINT";

/// What a transaction does. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionData {
    /// Locks `amount` of the sender's balance as forging stake.
    Stake { amount: u64 },
    /// Moves `amount` from sender to recipient.
    Purchase { amount: u64 },
    /// Block producer reward; only legal as the first transaction of a block.
    MiningReward {
        #[serde(rename = "includedTransactionHashes")]
        included_transaction_hashes: Vec<String>,
    },
    /// Application record (product, stock, dispute...) that moves no balance.
    Record { kind: String, payload: String },
}

impl TransactionData {
    pub fn is_reward(&self) -> bool {
        matches!(self, TransactionData::MiningReward { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub data: TransactionData,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub last_transaction_hash: Option<String>,
}

impl Transaction {
    pub fn new(
        from: String,
        to: String,
        data: TransactionData,
        last_transaction_hash: Option<String>,
    ) -> Self {
        Transaction {
            from,
            to,
            data,
            signature: None,
            last_transaction_hash,
        }
    }

    /// Identity of the transaction. The signature is not part of it.
    pub fn hash(&self) -> String {
        crypto_hash!(self.from, self.to, self.data, self.last_transaction_hash)
    }

    /// Signs the transaction hash. Only the key owning `from` may sign.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        if keypair.address() != self.from {
            return Err(ChainError::InvalidTransaction(
                "You cannot sign transactions for other wallets".to_string(),
            ));
        }
        self.signature = Some(keypair.sign_hex(self.hash().as_bytes())?);
        Ok(())
    }

    pub fn is_mint(&self) -> bool {
        self.from == MINT_ADDRESS
    }
}
