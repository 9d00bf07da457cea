//! chaincore - consensus-validating ledger core for a Bitcoin-family chain
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, validation rules and the chain controller
//! - [`transaction`] - Transaction types and context-free checks
//! - [`index`] - In-memory header tree with skip pointers
//!
//! ## Consensus
//! - [`params`] - Per-network parameters
//! - [`consensus`] - Monetary and lock-time constants
//! - [`pow`] - Compact targets, chainwork and retargeting
//! - [`deployments`] - Versionbits activation cache
//! - [`checkpoints`] - Checkpoint guard
//! - [`script`] - Script parsing and signature-operation counting
//! - [`verify`] - Script verification seam and parallel dispatch
//!
//! ## State Management
//! - [`coins`] - Unspent outputs and the block-scoped coin view
//! - [`persistence`] - Storage backends (SQLite, in-memory)
//! - [`chaindb`] - Chain schema over a storage backend
//! - [`cache`] - Caching utilities
//!
//! ## Integration
//! - [`events`] - Connect/disconnect/reorganize notifications
//! - [`scan`] - Cancellable walks over the active chain
//! - [`clock`] - Network-adjusted time
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`hash`] - Double SHA-256 and hex helpers
//! - [`encoding`] - Consensus serialization

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod index;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod checkpoints;
pub mod consensus;
pub mod deployments;
pub mod params;
pub mod pow;
pub mod script;
pub mod verify;

// ============================================================================
// State Management
// ============================================================================
pub mod cache;
pub mod chaindb;
pub mod coins;
pub mod persistence;

// ============================================================================
// Integration
// ============================================================================
pub mod clock;
pub mod events;
pub mod scan;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod encoding;
pub mod error;
pub mod hash;

pub use blockchain::{AcceptOutcome, Block, BlockHeader, Chain, ChainOptions, ChainState};
pub use error::{ChainError, RejectCode, Rejection, Result};
