//! Domain services served by the operation pipeline.
//!
//! Each domain registers its named operations on an `OperationRouter`.

pub mod ledger;

pub use ledger::{Ledger, LedgerService, LogNotifier, Notifier, Transfer};
