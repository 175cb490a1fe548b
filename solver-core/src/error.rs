//! Solver Errors
//!
//! Every failure in the solver surfaces as the terminal status of some
//! pipe, so the error type has to be cheap to clone: a failed edge hands
//! the same error to every requester it ever answers.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Coarse classification of a [`SolverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was canceled by its requester.
    Canceled,
    /// The request ran past its deadline.
    DeadlineExceeded,
    /// A bug in the solver or in an edge implementation.
    Internal,
    /// The caller asked for something that does not exist.
    InvalidArgument,
    /// The scheduler is no longer running.
    Unavailable,
    /// Anything returned by leaf work.
    Unknown,
}

/// Errors produced by pipes, edges and the scheduler.
#[derive(Debug, Clone, Error)]
pub enum SolverError {
    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("pipe already completed")]
    PipeClosed,

    #[error("scheduler stopped")]
    Stopped,

    #[error(transparent)]
    Other(Arc<dyn StdError + Send + Sync>),
}

impl SolverError {
    /// Wrap an arbitrary error returned by leaf work.
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }

    /// Build an internal error from a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Canceled => ErrorKind::Canceled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Internal(_) | Self::PipeClosed => ErrorKind::Internal,
            Self::InvalidRequest(_) => ErrorKind::InvalidArgument,
            Self::Stopped => ErrorKind::Unavailable,
            Self::Other(_) => ErrorKind::Unknown,
        }
    }

    /// True for errors that mean "the requester gave up", which callers
    /// usually do not want to retry.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }
}

pub type Result<T, E = SolverError> = std::result::Result<T, E>;
