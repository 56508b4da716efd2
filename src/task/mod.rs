//! Task module - sub-task records and the ledger that owns them.
//!
//! This module is designed with formal verification in mind:
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented and enforced by the ledger's mutators
//! - Pure functions are separated from IO operations

mod ledger;
mod subtask;

pub use ledger::{Ledger, LedgerError};
pub use subtask::{Source, SubtaskRecord, SubtaskStatus};
