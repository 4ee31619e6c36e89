//! Order-independent SHA-256 digest over a list of fields.
//!
//! Every field is stringified (strings verbatim, `None`/null as the empty
//! string, everything else as JSON), the strings are sorted, concatenated and
//! hashed. Sorting makes the digest independent of argument order, so two
//! fields of the same type can be swapped without changing the hash. No caller
//! in this crate depends on positional order.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stringify a single field the way the hasher sees it.
pub fn field<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        Ok(Value::Null) => String::new(),
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

/// Digest pre-stringified fields into 64 hex characters.
pub fn hash_fields(mut fields: Vec<String>) -> String {
    fields.sort();
    let mut hasher = Sha256::new();
    for f in &fields {
        hasher.update(f.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// `crypto_hash!(a, b, c)` stringifies each argument with [`field`] and digests them.
#[macro_export]
macro_rules! crypto_hash {
    ($($arg:expr),+ $(,)?) => {
        $crate::hasher::hash_fields(vec![$($crate::hasher::field(&$arg)),+])
    };
}

/// Number of leading zero bits in a hex digest.
pub fn leading_zero_bits(hex_hash: &str) -> u32 {
    let mut bits = 0;
    for c in hex_hash.chars() {
        match c.to_digit(16) {
            Some(0) => bits += 4,
            Some(d) => return bits + (d as u8).leading_zeros() - 4,
            None => return bits,
        }
    }
    bits
}
