// Block structure and mining (`chain`), ledger replay (`state`), block acceptance (`validation`).
pub mod chain;
pub mod state;
pub mod validation;

pub use chain::*;
pub use state::*;
pub use validation::*;
