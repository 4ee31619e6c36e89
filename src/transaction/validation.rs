//! Transaction validity: size limit and signature checks
use crate::crypto::verify_hex_signature;
use crate::error::ChainError;
use crate::transaction::types::{Transaction, MAX_TRANSACTION_SIZE};
use tracing::debug;

impl Transaction {
    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Stateless check: mint-issued, or signed by `from` over its own hash.
    pub fn is_valid(&self) -> bool {
        if let Err(e) = self.validate_size() {
            debug!(error = %e, "transaction rejected");
            return false;
        }

        if self.is_mint() {
            return true;
        }

        let Some(signature) = &self.signature else {
            return false;
        };

        match verify_hex_signature(&self.from, self.hash().as_bytes(), signature) {
            Ok(()) => true,
            Err(e) => {
                debug!(from = %self.from, error = %e, "transaction signature rejected");
                false
            }
        }
    }
}
