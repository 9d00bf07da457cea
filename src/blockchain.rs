// Thin re-export module: implementation is in `blockchain/core.rs` so block
// types, validation and chain management can be split further.

pub mod core;
pub use core::*;
