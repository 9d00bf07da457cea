//! Error types for chaincore

use crate::hash::{to_hex, Sha256Hash};
use crate::transaction::OutPoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification attached to every rejected block or transaction so that
/// upstream peer policy can decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Checkpoint,
}

impl RejectCode {
    /// Wire value used by the reject message of the p2p protocol.
    pub fn as_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Checkpoint => 0x43,
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RejectCode::Malformed => "malformed",
            RejectCode::Invalid => "invalid",
            RejectCode::Obsolete => "obsolete",
            RejectCode::Duplicate => "duplicate",
            RejectCode::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// A consensus rejection: machine-stable reason string, reject class and a
/// misbehaviour score in `0..=100`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason} ({code}, score {score})")]
pub struct Rejection {
    pub code: RejectCode,
    pub reason: String,
    pub score: u32,
}

impl Rejection {
    pub fn new(code: RejectCode, reason: impl Into<String>, score: u32) -> Self {
        Rejection {
            code,
            reason: reason.into(),
            score: score.min(100),
        }
    }

    pub fn invalid(reason: impl Into<String>, score: u32) -> Self {
        Self::new(RejectCode::Invalid, reason, score)
    }

    pub fn malformed(reason: impl Into<String>, score: u32) -> Self {
        Self::new(RejectCode::Malformed, reason, score)
    }

    pub fn obsolete(reason: impl Into<String>, score: u32) -> Self {
        Self::new(RejectCode::Obsolete, reason, score)
    }

    pub fn duplicate(reason: impl Into<String>) -> Self {
        Self::new(RejectCode::Duplicate, reason, 0)
    }

    pub fn checkpoint(reason: impl Into<String>) -> Self {
        Self::new(RejectCode::Checkpoint, reason, 100)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Block rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("Orphan block {}: parent {} is unknown", to_hex(.hash), to_hex(.parent))]
    Orphan {
        hash: Sha256Hash,
        parent: Sha256Hash,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Missing or spent coin {0}")]
    MissingCoin(OutPoint),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Corrupt chain data: {0}")]
    Corrupt(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(String),
}

impl ChainError {
    /// The consensus rejection carried by this error, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ChainError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Reason string of a rejection, for logging and assertions.
    pub fn reason(&self) -> Option<&str> {
        self.rejection().map(|r| r.reason.as_str())
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::Database(err.to_string())
    }
}

impl From<bincode::Error> for ChainError {
    fn from(err: bincode::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::Config(err.to_string())
    }
}

impl From<hex::FromHexError> for ChainError {
    fn from(err: hex::FromHexError) -> Self {
        ChainError::Serialization(format!("invalid hex: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
