//! Request and status snapshots carried by a pipe.

use crate::error::SolverError;

/// What the awaiting side asked for.
///
/// The payload is fixed when the pipe is created. Only `canceled` ever
/// changes, and only from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<Req> {
    pub payload: Req,
    pub canceled: bool,
}

/// A snapshot of a pipe's progress.
///
/// `canceled` implies `completed`. A completed status carries either a
/// value or an error, never both; on error `value` is reset to its
/// default.
#[derive(Debug, Clone, Default)]
pub struct Status<V> {
    pub completed: bool,
    pub canceled: bool,
    pub err: Option<SolverError>,
    pub value: V,
}

impl<V> Status<V> {
    /// Completed without an error.
    pub fn is_success(&self) -> bool {
        self.completed && self.err.is_none()
    }

    /// Completed with an error.
    pub fn is_failure(&self) -> bool {
        self.completed && self.err.is_some()
    }
}
