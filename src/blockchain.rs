// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// block structure and mining (`chain`), ledger replay (`state`) and block
// acceptance (`validation`).

pub mod core;
pub use core::*;
