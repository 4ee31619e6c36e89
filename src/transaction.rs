//! Transactions: data model in `types`, validity checks in `validation`

pub mod types;
pub mod validation;

pub use types::*;
