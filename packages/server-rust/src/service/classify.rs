//! The server's error classifier: core taxonomy rules plus pipeline failures.

use keel_core::Classifier;

use super::operation::OperationError;
use super::unit_of_work::RollbackIncomplete;

/// Classifier used by the operation wrapper and the resilient executor.
///
/// Recognizes everything [`Classifier::default`] does, plus
/// [`OperationError`] and [`RollbackIncomplete`]. A rollback that left
/// compensations unapplied is `Internal` even when the step failure that
/// triggered it was of a milder kind, because it is the outermost cause.
#[must_use]
pub fn standard_classifier() -> Classifier {
    Classifier::default()
        .with::<OperationError>()
        .with::<RollbackIncomplete>()
}
