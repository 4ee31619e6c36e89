//! ForgeChain - a peer-to-peer ledger with a stake-weighted forger lottery
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, mining, ledger replay and block acceptance
//! - [`transaction`] - Transaction types, signing and validity
//! - [`mempool`] - Pending transaction pool
//! - [`hasher`] - Order-independent SHA-256 over field lists
//!
//! ## Consensus & Mining
//! - [`consensus`] - Stake registry and forger lottery
//! - [`miner`] - Candidate selection and the proof-of-work worker
//!
//! ## Cryptography
//! - [`crypto`] - Signatures and verification (secp256k1)
//!
//! ## State Management
//! - [`persistence`] - Key-value store trait, SQLite backend, typed views
//!
//! ## Networking
//! - [`network`] - Wire protocol and authenticated WebSocket peers
//! - [`sync`] - Chain catch-up
//! - [`node`] - The node event loop tying everything together
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod hasher;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod consensus;
pub mod miner;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
