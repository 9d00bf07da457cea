//! Transaction module split into types and validation

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::{
    calculate_sequence_locks, check_transaction, is_final_tx, SequenceLock,
};
