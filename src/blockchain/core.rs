// core.rs splits the chain into submodules: block types, validation rules,
// the running totals, and the controller with its connect/disconnect steps.
pub mod block;
pub mod chain;
pub mod connect;
pub mod state;
pub mod validation;

pub use block::*;
pub use chain::*;
pub use state::*;
pub use validation::*;
