//! Operation Edges
//!
//! [`OpEdge`] is the stock edge state machine. It evaluates an [`Op`]:
//! first every input edge is requested to completion, then the op's leaf
//! work runs on the inputs' results.
//!
//! # Lifecycle
//!
//! ```text
//! Initial -> Inputs -> Executing -> Complete
//!     \________\___________\______> failed
//! ```
//!
//! Results and failures are both cached: once an edge has settled, every
//! request it ever sees is answered from the cache. Cancellation is not a
//! failure. When every requester has canceled, the edge cancels its own
//! requests, answers `Canceled` once they settle, and forgets the
//! abandoned work so the next request starts it again.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::edge::{
    CachedResult, Edge, EdgeReceiver, EdgeRequest, EdgeSender, EdgeState, EdgeStatus, GraphRef,
    IndexKey, Output, Response,
};
use super::scheduler::PipeFactory;
use crate::error::{Result, SolverError};

/// A unit of work in the build graph.
pub trait Op: Send + Sync + 'static {
    /// Stable identifier of the operation itself, without its inputs.
    fn digest(&self) -> &str;

    fn inputs(&self) -> &[GraphRef];

    /// Run the operation on the results of its inputs, in the order of
    /// [`inputs`](Op::inputs).
    fn exec(
        &self,
        inputs: Vec<CachedResult>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Output>>;
}

/// An [`Op`] backed by a closure.
pub struct FnOp<F> {
    digest: String,
    inputs: Vec<GraphRef>,
    exec: F,
}

impl<F, Fut> FnOp<F>
where
    F: Fn(Vec<CachedResult>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Output>> + Send + 'static,
{
    pub fn new(digest: impl Into<String>, inputs: Vec<GraphRef>, exec: F) -> Self {
        Self {
            digest: digest.into(),
            inputs,
            exec,
        }
    }
}

impl<F, Fut> Op for FnOp<F>
where
    F: Fn(Vec<CachedResult>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Output>> + Send + 'static,
{
    fn digest(&self) -> &str {
        &self.digest
    }

    fn inputs(&self) -> &[GraphRef] {
        &self.inputs
    }

    fn exec(
        &self,
        inputs: Vec<CachedResult>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Output>> {
        Box::pin((self.exec)(inputs, token))
    }
}

/// One input of an [`OpEdge`].
struct Input {
    graph_ref: GraphRef,
    request: Option<EdgeReceiver>,
    result: Option<CachedResult>,
}

/// Edge that evaluates an [`Op`].
pub struct OpEdge {
    op: Arc<dyn Op>,
    status: EdgeStatus,
    inputs: Vec<Input>,
    exec: Option<EdgeReceiver>,
    result: Option<CachedResult>,
    err: Option<SolverError>,
    index_key: Option<IndexKey>,
    keys_did_change: bool,
    has_active_outgoing: bool,
}

impl OpEdge {
    pub fn new(op: Arc<dyn Op>) -> Self {
        let inputs = op
            .inputs()
            .iter()
            .map(|graph_ref| Input {
                graph_ref: graph_ref.clone(),
                request: None,
                result: None,
            })
            .collect();

        Self {
            op,
            status: EdgeStatus::Initial,
            inputs,
            exec: None,
            result: None,
            err: None,
            index_key: None,
            keys_did_change: false,
            has_active_outgoing: false,
        }
    }

    pub fn status(&self) -> EdgeStatus {
        self.status
    }

    fn state(&self) -> EdgeState {
        EdgeState {
            status: self.status,
            index_key: self.index_key.clone(),
            result: self.result.clone(),
        }
    }

    /// Fold answers to our own requests into the edge state.
    fn process_updates(&mut self, updates: &[EdgeReceiver]) {
        for update in updates {
            let status = update.status();

            if self.exec.as_ref().is_some_and(|r| r.same_pipe(update)) {
                if !status.completed {
                    continue;
                }
                self.exec = None;
                match status.err {
                    None => {
                        let output = match status.value {
                            Response::Output(output) => output,
                            _ => Output::Null,
                        };
                        self.result = Some(CachedResult {
                            id: self.op.digest().to_string(),
                            output,
                            index_key: self.index_key.clone(),
                        });
                        self.status = EdgeStatus::Complete;
                    }
                    Some(_) if status.canceled => {}
                    Some(err) => self.err = Some(err),
                }
                continue;
            }

            let Some(input) = self
                .inputs
                .iter_mut()
                .find(|i| i.request.as_ref().is_some_and(|r| r.same_pipe(update)))
            else {
                continue;
            };
            if !status.completed {
                continue;
            }
            input.request = None;
            match (status.err, status.value) {
                (
                    None,
                    Response::State(EdgeState {
                        result: Some(result),
                        ..
                    }),
                ) => input.result = Some(result),
                (None, _) => {
                    self.err = Some(SolverError::internal(format!(
                        "input {} completed without a result",
                        input.graph_ref
                    )));
                }
                (Some(_), _) if status.canceled => {}
                (Some(err), _) => self.err = Some(err),
            }
        }
    }

    fn cancel_outgoing(&self) {
        for input in &self.inputs {
            if let Some(request) = &input.request {
                request.cancel();
            }
        }
        if let Some(exec) = &self.exec {
            exec.cancel();
        }
    }

    /// Drop requests that were canceled and settled, so a new requester
    /// starts them again.
    fn reset_canceled(&mut self) {
        for input in &mut self.inputs {
            if input.request.as_ref().is_some_and(|r| r.status().completed) {
                input.request = None;
            }
        }
        if self.exec.as_ref().is_some_and(|r| r.status().completed) {
            self.exec = None;
        }
        self.status = EdgeStatus::Initial;
    }

    fn answer(&self, req: &EdgeSender) {
        let result = match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(Response::State(self.state())),
        };
        if let Err(err) = req.finalize(result) {
            debug!(pipe_id = %req.id(), error = %err, "request already answered");
        }
    }

    /// Request whatever is missing to make progress.
    fn advance(&mut self, factory: &mut PipeFactory<'_>) {
        for input in &mut self.inputs {
            if input.request.is_none() && input.result.is_none() {
                let request = factory.new_input_request(&input.graph_ref, EdgeRequest::complete());
                input.request = Some(request);
            }
        }
        if self.inputs.iter().any(|i| i.result.is_none()) {
            self.status = EdgeStatus::Inputs;
            return;
        }

        if self.exec.is_some() {
            return;
        }

        let key = self.compute_index_key();
        if self.index_key.as_ref() != Some(&key) {
            self.index_key = Some(key);
            self.keys_did_change = true;
        }

        let results: Vec<CachedResult> = self
            .inputs
            .iter()
            .filter_map(|i| i.result.clone())
            .collect();
        let op = Arc::clone(&self.op);
        self.exec = Some(factory.new_func_request(move |token| async move {
            op.exec(results, token).await.map(Response::Output)
        }));
        self.status = EdgeStatus::Executing;
    }

    fn compute_index_key(&self) -> IndexKey {
        let inputs: Vec<&str> = self
            .inputs
            .iter()
            .filter_map(|i| i.result.as_ref())
            .map(|r| r.index_key.as_ref().map_or(r.id.as_str(), IndexKey::as_str))
            .collect();
        IndexKey::new(format!("{}({})", self.op.digest(), inputs.join(",")))
    }
}

fn answer_canceled(req: &EdgeSender) {
    if let Err(err) = req.finalize(Err(SolverError::Canceled)) {
        debug!(pipe_id = %req.id(), error = %err, "request already answered");
    }
}

impl Edge for OpEdge {
    fn unpark(
        &mut self,
        incoming: &[EdgeSender],
        updates: &[EdgeReceiver],
        _outgoing: &[EdgeReceiver],
        factory: &mut PipeFactory<'_>,
    ) {
        self.process_updates(updates);

        let open: Vec<&EdgeSender> = incoming
            .iter()
            .filter(|req| !req.status().completed)
            .collect();
        let all_canceled = !open.is_empty() && open.iter().all(|req| req.is_canceled());

        if self.err.is_some() || self.result.is_some() || all_canceled {
            if self.result.is_none() {
                self.cancel_outgoing();
            }
            if self.has_active_outgoing {
                return;
            }
            for req in &open {
                if self.err.is_none() && self.result.is_none() {
                    answer_canceled(req);
                } else {
                    self.answer(req);
                }
            }
            if all_canceled && self.result.is_none() && self.err.is_none() {
                trace!(edge = %factory.edge(), "all requests canceled");
                self.reset_canceled();
            }
            return;
        }

        let mut waiting = false;
        for req in &open {
            if req.is_canceled() {
                answer_canceled(req);
            } else {
                waiting = true;
            }
        }
        if !waiting {
            return;
        }

        let before = self.status;
        self.advance(factory);
        if self.status != before {
            let state = Response::State(self.state());
            for req in open.iter().filter(|req| !req.status().completed) {
                if let Err(err) = req.update(state.clone()) {
                    debug!(pipe_id = %req.id(), error = %err, "progress after request completed");
                }
            }
        }
    }

    fn mark_failed(
        &mut self,
        incoming: &[EdgeSender],
        _factory: &mut PipeFactory<'_>,
        err: SolverError,
    ) {
        self.err = Some(err);
        self.cancel_outgoing();
        for req in incoming.iter().filter(|req| !req.status().completed) {
            self.answer(req);
        }
    }

    fn take_keys_changed(&mut self) -> bool {
        std::mem::take(&mut self.keys_did_change)
    }

    fn current_index_key(&self) -> Option<IndexKey> {
        self.index_key.clone()
    }

    fn set_has_active_outgoing(&mut self, active: bool) {
        self.has_active_outgoing = active;
    }

    fn result(&self) -> Option<CachedResult> {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(digest: &str, inputs: Vec<GraphRef>) -> OpEdge {
        let op = FnOp::new(digest, inputs, |_, _| async { Ok(Output::Null) });
        OpEdge::new(Arc::new(op))
    }

    fn finished(id: &str, key: Option<&str>) -> CachedResult {
        CachedResult {
            id: id.to_string(),
            output: Output::Null,
            index_key: key.map(IndexKey::new),
        }
    }

    #[test]
    fn starts_initial() {
        let edge = noop("op", vec![GraphRef::new("a", 0)]);
        assert_eq!(edge.status(), EdgeStatus::Initial);
        assert_eq!(edge.inputs.len(), 1);
        assert!(edge.result().is_none());
        assert!(edge.current_index_key().is_none());
    }

    #[test]
    fn index_key_prefers_input_keys() {
        let mut edge = noop("op", vec![GraphRef::new("a", 0), GraphRef::new("b", 0)]);
        edge.inputs[0].result = Some(finished("a", Some("a()")));
        edge.inputs[1].result = Some(finished("b", None));

        assert_eq!(edge.compute_index_key().as_str(), "op(a(),b)");
    }

    #[test]
    fn keys_changed_flag_resets_on_read() {
        let mut edge = noop("op", vec![]);
        edge.keys_did_change = true;
        assert!(edge.take_keys_changed());
        assert!(!edge.take_keys_changed());
    }

    #[test]
    fn late_cancel_keeps_first_answer() {
        let pipe = crate::solver::EdgePipe::new(EdgeRequest::complete());
        pipe.sender.finalize(Ok(Response::Empty)).unwrap();

        answer_canceled(&pipe.sender);

        assert!(pipe.receiver.receive());
        let status = pipe.receiver.status();
        assert!(status.is_success());
        assert!(!status.canceled);
    }

    #[tokio::test]
    async fn exec_passes_inputs_in_order() {
        let op = FnOp::new(
            "concat",
            vec![GraphRef::new("a", 0), GraphRef::new("b", 0)],
            |inputs: Vec<CachedResult>, _| async move {
                let ids: Vec<String> = inputs.into_iter().map(|r| r.id).collect();
                Ok(Output::from(ids.join("+")))
            },
        );

        let out = op
            .exec(
                vec![finished("a", None), finished("b", None)],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, Output::from("a+b"));
        assert_eq!(op.inputs().len(), 2);
        assert_eq!(op.digest(), "concat");
    }
}
