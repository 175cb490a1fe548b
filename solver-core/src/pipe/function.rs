//! Computation-backed pipes.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::channel::Pipe;
use crate::error::{Result, SolverError};

impl<Req, V> Pipe<Req, V>
where
    Req: Default + Send + Sync + 'static,
    V: Clone + Default + Send + 'static,
{
    /// Create a pipe answered by `f`.
    ///
    /// Returns the pipe and a start future. Nothing runs until the future
    /// is spawned; it then calls `f` and finalizes the pipe with whatever
    /// `f` returns. Canceling the receiver cancels the token handed to
    /// `f`, which is expected to notice and return
    /// [`SolverError::Canceled`]. A panic in `f` finalizes the pipe with an
    /// internal error.
    pub fn with_function<F, Fut>(f: F) -> (Self, impl Future<Output = ()> + Send + 'static)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let pipe = Self::new(Req::default());
        let token = CancellationToken::new();

        let on_cancel = token.clone();
        pipe.set_on_receive_completion(move || on_cancel.cancel());

        let sender = pipe.sender.clone();
        let start = async move {
            let result = match AssertUnwindSafe(async move { f(token).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    error!(pipe_id = %sender.id(), "computation panicked");
                    Err(SolverError::internal("computation panicked"))
                }
            };
            if let Err(err) = sender.finalize(result) {
                debug!(pipe_id = %sender.id(), error = %err, "computation finished after pipe completed");
            }
        };

        (pipe, start)
    }
}
