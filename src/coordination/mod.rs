//! Coordination engine for cross-chain swap orchestration
//!
//! The coordination engine:
//! 1. Applies normalised chain events to the swap ledger and secret vault
//! 2. Scans the ledger for swaps whose next action is due
//! 3. Dispatches those actions through the transaction submitter
//! 4. Corrects reveals dropped by reorgs and sweeps expired swaps

pub mod action;
pub mod engine;

pub use action::Action;
pub use engine::{CoordinationEngine, EngineStats, ScanSummary};
