//! Scheduler
//!
//! The scheduler owns the dispatch loop and the bookkeeping of every open
//! request between edges.
//!
//! # Algorithm
//!
//! 1. Anything that might let an edge make progress (a new request, a
//!    cancellation, an answer to one of its own requests) signals the edge
//!    into the dispatch queue. Signals for an edge that is already queued
//!    collapse into one.
//! 2. A single dispatch thread pops edges in FIFO order. For each edge it
//!    pulls the status of every outgoing request, then calls
//!    [`Edge::unpark`] with what changed.
//! 3. Requests that reached a terminal status are dropped from the
//!    bookkeeping. If the edge published a new index key, it is registered
//!    in the edge index.
//! 4. An edge that returns still owing answers but waiting on nothing, or
//!    waiting on requests nobody asked it for, is failed on the spot.
//!    Either state would otherwise hang or leak.
//!
//! All edge state is mutated from the dispatch thread only. Leaf work runs
//! on the tokio runtime and only touches the pipes it answers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::edge::{
    CachedResult, Edge, EdgeId, EdgePipe, EdgeReceiver, EdgeRequest, EdgeSender, GraphRef, Response,
    SharedEdge,
};
use super::factory::EdgeFactory;
use super::queue::DispatchQueue;
use crate::config::{SchedulerConfig, DEBUG_ENV};
use crate::error::{Result, SolverError};

/// Open requests per edge.
#[derive(Default)]
struct Bookkeeping {
    /// Requests the edge must answer.
    incoming: HashMap<EdgeId, Vec<EdgeSender>>,
    /// Requests the edge is waiting on.
    outgoing: HashMap<EdgeId, Vec<EdgeReceiver>>,
}

impl Bookkeeping {
    fn incoming_of(&self, id: EdgeId) -> Vec<EdgeSender> {
        self.incoming.get(&id).cloned().unwrap_or_default()
    }

    fn outgoing_of(&self, id: EdgeId) -> Vec<EdgeReceiver> {
        self.outgoing.get(&id).cloned().unwrap_or_default()
    }

    /// Forget every request of `id` that reached a terminal status.
    ///
    /// Returns how many incoming and outgoing requests remain open.
    fn retain_open(&mut self, id: EdgeId) -> (usize, usize) {
        let open_incoming = match self.incoming.get_mut(&id) {
            Some(senders) => {
                senders.retain(|s| !s.status().completed);
                senders.len()
            }
            None => 0,
        };
        if open_incoming == 0 {
            self.incoming.remove(&id);
        }

        let open_outgoing = match self.outgoing.get_mut(&id) {
            Some(receivers) => {
                receivers.retain(|r| !r.status().completed);
                receivers.len()
            }
            None => 0,
        };
        if open_outgoing == 0 {
            self.outgoing.remove(&id);
        }

        (open_incoming, open_outgoing)
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.incoming.values().map(Vec::len).sum(),
            self.outgoing.values().map(Vec::len).sum(),
        )
    }
}

struct Inner {
    queue: Mutex<DispatchQueue>,
    wake: Condvar,
    state: Mutex<Bookkeeping>,
    edges: Arc<dyn EdgeFactory>,
    runtime: Handle,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl Inner {
    fn new(edges: Arc<dyn EdgeFactory>, config: SchedulerConfig, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(DispatchQueue::new()),
            wake: Condvar::new(),
            state: Mutex::new(Bookkeeping::default()),
            edges,
            runtime,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Queue `edge` for dispatch unless it is already waiting. Does nothing
    /// once the scheduler stopped.
    fn signal(&self, edge: &SharedEdge) {
        let mut queue = self.queue.lock();
        if self.shutdown.is_cancelled() {
            return;
        }
        if queue.push(edge) {
            self.wake.notify_one();
        }
    }

    /// A callback that signals `edge` again. Holds only weak references so
    /// that pipes stored inside edges do not keep the graph alive.
    fn resignal(self: &Arc<Self>, edge: &SharedEdge) -> impl Fn() + Clone + Send + Sync + 'static {
        let scheduler = Arc::downgrade(self);
        let edge = Arc::downgrade(edge);
        move || {
            if let (Some(scheduler), Some(edge)) = (scheduler.upgrade(), edge.upgrade()) {
                scheduler.signal(&edge);
            }
        }
    }

    fn run(self: &Arc<Self>) {
        info!("dispatch loop started");
        while let Some(edge) = self.next() {
            self.dispatch(&edge);
        }
        info!("dispatch loop stopped");
    }

    /// Block until an edge is queued or the scheduler stops.
    fn next(&self) -> Option<SharedEdge> {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(edge) = queue.pop() {
                return Some(edge);
            }
            self.wake.wait(&mut queue);
        }
    }

    fn dispatch(self: &Arc<Self>, edge: &SharedEdge) {
        let mut state = self.state.lock();
        let id = edge.id();
        let incoming = state.incoming_of(id);
        let outgoing = state.outgoing_of(id);

        let mut updates: SmallVec<[EdgeReceiver; 4]> = SmallVec::new();
        let mut has_active_outgoing = false;
        for receiver in &outgoing {
            if receiver.receive() {
                updates.push(receiver.clone());
            }
            if !receiver.status().completed {
                has_active_outgoing = true;
            }
        }

        trace!(
            edge = %edge.graph_ref(),
            edge_id = id.raw(),
            incoming = incoming.len(),
            updates = updates.len(),
            outgoing = outgoing.len(),
            "dispatch"
        );
        if self.config.debug {
            log_pipes(edge, &incoming, &outgoing);
        }

        let mut machine = edge.lock();
        machine.set_has_active_outgoing(has_active_outgoing);
        let unparked = {
            let mut factory = PipeFactory {
                scheduler: self,
                state: &mut *state,
                edge,
            };
            panic::catch_unwind(AssertUnwindSafe(|| {
                machine.unpark(&incoming, &updates, &outgoing, &mut factory)
            }))
        };
        if let Err(payload) = unparked {
            let reason = panic_message(payload.as_ref());
            error!(edge = %edge.graph_ref(), "edge panicked during dispatch: {reason}");
            let err = SolverError::internal(format!("edge panicked during dispatch: {reason}"));
            self.fail_edge(&mut state, edge, &mut **machine, err);
            return;
        }

        let (open_incoming, open_outgoing) = state.retain_open(id);

        if machine.take_keys_changed() {
            if let Some(key) = machine.current_index_key() {
                let existing = self
                    .edges
                    .index()
                    .load_or_store(key.clone(), SharedEdge::clone(edge));
                if Arc::ptr_eq(&existing, edge) {
                    debug!(edge = %edge.graph_ref(), key = %key, "registered index key");
                } else {
                    debug!(
                        edge = %edge.graph_ref(),
                        equivalent = %existing.graph_ref(),
                        key = %key,
                        "equivalent edge registered under key; not merging"
                    );
                }
            }
        }

        let violation = if open_incoming > 0 && open_outgoing == 0 {
            Some("return leaving incoming open")
        } else if open_incoming == 0 && open_outgoing > 0 {
            Some("return leaving outgoing open")
        } else {
            None
        };

        if let Some(violation) = violation {
            error!(
                edge = %edge.graph_ref(),
                open_incoming,
                open_outgoing,
                "scheduler invariant violated: {violation}"
            );
            let err = SolverError::internal(format!(
                "scheduler error: {violation}. Please report this with {DEBUG_ENV}=1"
            ));
            self.fail_edge(&mut state, edge, &mut **machine, err);
        }
    }

    /// Fail `edge` after a broken dispatch and cancel whatever it still
    /// waits on, since nobody will read those answers.
    ///
    /// If the edge cannot even be failed, the scheduler stops so that
    /// waiting builds return instead of hanging.
    fn fail_edge(
        self: &Arc<Self>,
        state: &mut Bookkeeping,
        edge: &SharedEdge,
        machine: &mut dyn Edge,
        err: SolverError,
    ) {
        let id = edge.id();
        let incoming = state.incoming_of(id);
        let failed = {
            let mut factory = PipeFactory {
                scheduler: self,
                state: &mut *state,
                edge,
            };
            panic::catch_unwind(AssertUnwindSafe(|| {
                machine.mark_failed(&incoming, &mut factory, err)
            }))
        };
        if let Err(payload) = failed {
            error!(
                edge = %edge.graph_ref(),
                "edge panicked while being failed, stopping scheduler: {}",
                panic_message(payload.as_ref())
            );
            self.shutdown.cancel();
            return;
        }

        for receiver in state.outgoing_of(id) {
            if !receiver.status().completed {
                receiver.cancel();
            }
        }
        state.retain_open(id);
    }

    /// Open a request from `from` (or from outside, if `None`) to `target`.
    fn new_pipe(
        self: &Arc<Self>,
        state: &mut Bookkeeping,
        target: &SharedEdge,
        from: Option<&SharedEdge>,
        request: EdgeRequest,
    ) -> EdgePipe {
        let pipe = EdgePipe::new(request);

        if let Some(from) = from {
            let resignal = self.resignal(from);
            pipe.set_on_send_completion(resignal.clone());
            pipe.set_on_update(resignal);
            state
                .outgoing
                .entry(from.id())
                .or_default()
                .push(pipe.receiver.clone());
        }

        pipe.set_on_receive_completion(self.resignal(target));
        state
            .incoming
            .entry(target.id())
            .or_default()
            .push(pipe.sender.clone());

        self.signal(target);
        pipe
    }

    /// Open a request from `edge` answered by `f` on the runtime.
    fn new_request_with_func<F, Fut>(
        self: &Arc<Self>,
        state: &mut Bookkeeping,
        edge: &SharedEdge,
        f: F,
    ) -> EdgeReceiver
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let (pipe, start) = EdgePipe::with_function(f);

        let resignal = self.resignal(edge);
        pipe.set_on_send_completion(resignal.clone());
        pipe.set_on_update(resignal);
        state
            .outgoing
            .entry(edge.id())
            .or_default()
            .push(pipe.receiver.clone());

        self.runtime.spawn(start);
        pipe.receiver
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

fn log_pipes(edge: &SharedEdge, incoming: &[EdgeSender], outgoing: &[EdgeReceiver]) {
    for sender in incoming {
        let status = sender.status();
        debug!(
            edge = %edge.graph_ref(),
            pipe_id = %sender.id(),
            desired = ?sender.payload().desired_state,
            canceled = sender.is_canceled(),
            completed = status.completed,
            "incoming request"
        );
    }
    for receiver in outgoing {
        let status = receiver.status();
        debug!(
            edge = %edge.graph_ref(),
            pipe_id = %receiver.id(),
            completed = status.completed,
            canceled = status.canceled,
            error = ?status.err,
            "outgoing request"
        );
    }
}

/// Handed to an edge during dispatch to open new outgoing requests.
pub struct PipeFactory<'a> {
    scheduler: &'a Arc<Inner>,
    state: &'a mut Bookkeeping,
    edge: &'a SharedEdge,
}

impl PipeFactory<'_> {
    /// The edge being dispatched.
    pub fn edge(&self) -> &GraphRef {
        self.edge.graph_ref()
    }

    /// Request another edge.
    ///
    /// If `graph_ref` does not resolve, the returned request fails with an
    /// internal error instead, so the caller handles it like any other
    /// failed input.
    pub fn new_input_request(
        &mut self,
        graph_ref: &GraphRef,
        request: EdgeRequest,
    ) -> EdgeReceiver {
        match self.scheduler.edges.resolve(graph_ref) {
            Some(target) => {
                self.scheduler
                    .new_pipe(self.state, &target, Some(self.edge), request)
                    .receiver
            }
            None => {
                warn!(
                    edge = %self.edge.graph_ref(),
                    input = %graph_ref,
                    "input reference does not resolve"
                );
                let msg = format!(
                    "invalid input reference {graph_ref} requested by {}",
                    self.edge.graph_ref()
                );
                self.new_func_request(move |_| async move { Err(SolverError::Internal(msg)) })
            }
        }
    }

    /// Request the result of leaf work. `f` runs on the runtime and should
    /// return [`SolverError::Canceled`] promptly once its token is
    /// canceled.
    pub fn new_func_request<F, Fut>(&mut self, f: F) -> EdgeReceiver
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.scheduler.new_request_with_func(self.state, self.edge, f)
    }
}

/// Cancels the root request if `build` is dropped before it finished.
struct CancelOnDrop {
    receiver: EdgeReceiver,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.receiver.cancel();
        }
    }
}

/// Drives edges to completion.
///
/// Dropping the scheduler stops the dispatch thread.
pub struct Scheduler {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start a scheduler on the current tokio runtime, configured from the
    /// environment.
    pub fn new(edges: Arc<dyn EdgeFactory>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            SolverError::internal("scheduler must be started from within a tokio runtime")
        })?;
        Self::with_config(edges, SchedulerConfig::from_env(), runtime)
    }

    /// Start a scheduler whose leaf work runs on `runtime`.
    pub fn with_config(
        edges: Arc<dyn EdgeFactory>,
        config: SchedulerConfig,
        runtime: Handle,
    ) -> Result<Self> {
        let thread_name = config.thread_name.clone();
        let inner = Inner::new(edges, config, runtime);

        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || inner.run())
                .map_err(SolverError::other)?
        };

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Evaluate `graph_ref` to completion.
    ///
    /// Canceling `token` cancels the root request; the edges decide how
    /// far that propagates. Returns a copy of the edge's cached result.
    pub async fn build(
        &self,
        token: CancellationToken,
        graph_ref: &GraphRef,
    ) -> Result<CachedResult> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SolverError::Stopped);
        }

        let edge = inner.edges.resolve(graph_ref).ok_or_else(|| {
            SolverError::InvalidRequest(format!("invalid request {graph_ref} for build"))
        })?;

        let done = CancellationToken::new();
        let receiver = {
            let mut state = inner.state.lock();
            let pipe = inner.new_pipe(&mut state, &edge, None, EdgeRequest::complete());
            let on_done = done.clone();
            pipe.set_on_send_completion(move || on_done.cancel());
            pipe.receiver
        };
        let mut guard = CancelOnDrop {
            receiver: receiver.clone(),
            armed: true,
        };

        debug!(edge = %graph_ref, "build started");

        let mut canceled = false;
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = token.cancelled(), if !canceled => {
                    debug!(edge = %graph_ref, "build canceled by caller");
                    canceled = true;
                    receiver.cancel();
                }
                _ = inner.shutdown.cancelled() => return Err(SolverError::Stopped),
            }
        }
        guard.armed = false;

        receiver.receive();
        let status = receiver.status();
        if let Some(err) = status.err {
            debug!(edge = %graph_ref, error = %err, "build failed");
            return Err(err);
        }

        edge.result().ok_or_else(|| {
            SolverError::internal(format!("{graph_ref} completed without a cached result"))
        })
    }

    /// Like [`build`](Self::build), but cancels the root request at
    /// `deadline` and reports [`SolverError::DeadlineExceeded`] if that is
    /// what ended it.
    pub async fn build_with_deadline(
        &self,
        token: CancellationToken,
        graph_ref: &GraphRef,
        deadline: Instant,
    ) -> Result<CachedResult> {
        let child = token.child_token();
        let timer = {
            let child = child.clone();
            self.inner.runtime.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                child.cancel();
            })
        };

        let result = self.build(child, graph_ref).await;
        timer.abort();

        match result {
            Err(err) if err.is_canceled() && !token.is_cancelled() && Instant::now() >= deadline => {
                Err(SolverError::DeadlineExceeded)
            }
            other => other,
        }
    }

    /// Number of open (incoming, outgoing) requests across all edges.
    pub fn open_requests(&self) -> (usize, usize) {
        self.inner.state.lock().counts()
    }

    /// Stop the dispatch thread and fail any build still waiting with
    /// [`SolverError::Stopped`]. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        {
            let mut queue = self.inner.queue.lock();
            while queue.pop().is_some() {}
            self.inner.wake.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::solver::{EdgeCell, FnOp, MemoryEdgeFactory};

    /// Counts dispatches and answers every request immediately.
    struct Counting {
        dispatches: Arc<AtomicUsize>,
    }

    impl Edge for Counting {
        fn unpark(
            &mut self,
            incoming: &[EdgeSender],
            _updates: &[EdgeReceiver],
            _outgoing: &[EdgeReceiver],
            _factory: &mut PipeFactory<'_>,
        ) {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            for req in incoming {
                let _ = req.finalize(Ok(Response::Empty));
            }
        }

        fn mark_failed(
            &mut self,
            _incoming: &[EdgeSender],
            _factory: &mut PipeFactory<'_>,
            _err: SolverError,
        ) {
        }

        fn result(&self) -> Option<CachedResult> {
            None
        }
    }

    /// Never answers and never asks for anything.
    struct Stubborn {
        failed_with: Arc<Mutex<Option<SolverError>>>,
    }

    impl Edge for Stubborn {
        fn unpark(
            &mut self,
            _incoming: &[EdgeSender],
            _updates: &[EdgeReceiver],
            _outgoing: &[EdgeReceiver],
            _factory: &mut PipeFactory<'_>,
        ) {
        }

        fn mark_failed(
            &mut self,
            incoming: &[EdgeSender],
            _factory: &mut PipeFactory<'_>,
            err: SolverError,
        ) {
            for req in incoming {
                let _ = req.finalize(Err(err.clone()));
            }
            *self.failed_with.lock() = Some(err);
        }

        fn result(&self) -> Option<CachedResult> {
            None
        }
    }

    /// Asks for leaf work and then walks away from it.
    struct Abandoning {
        failed: Arc<AtomicUsize>,
    }

    impl Edge for Abandoning {
        fn unpark(
            &mut self,
            incoming: &[EdgeSender],
            _updates: &[EdgeReceiver],
            outgoing: &[EdgeReceiver],
            factory: &mut PipeFactory<'_>,
        ) {
            if outgoing.is_empty() {
                factory.new_func_request(|token| async move {
                    token.cancelled().await;
                    Err(SolverError::Canceled)
                });
            }
            for req in incoming {
                let _ = req.finalize(Ok(Response::Empty));
            }
        }

        fn mark_failed(
            &mut self,
            _incoming: &[EdgeSender],
            _factory: &mut PipeFactory<'_>,
            _err: SolverError,
        ) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }

        fn result(&self) -> Option<CachedResult> {
            None
        }
    }

    /// Panics on dispatch. Optionally panics again when failed.
    struct Exploding {
        panic_when_failed: bool,
    }

    impl Edge for Exploding {
        fn unpark(
            &mut self,
            _incoming: &[EdgeSender],
            _updates: &[EdgeReceiver],
            _outgoing: &[EdgeReceiver],
            _factory: &mut PipeFactory<'_>,
        ) {
            panic!("edge bug");
        }

        fn mark_failed(
            &mut self,
            incoming: &[EdgeSender],
            _factory: &mut PipeFactory<'_>,
            err: SolverError,
        ) {
            if self.panic_when_failed {
                panic!("still broken");
            }
            for req in incoming {
                let _ = req.finalize(Err(err.clone()));
            }
        }

        fn result(&self) -> Option<CachedResult> {
            None
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            debug: true,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn repeated_signals_dispatch_once() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let dispatches = Arc::new(AtomicUsize::new(0));
        let edge = EdgeCell::new(
            GraphRef::new("counting", 0),
            Counting {
                dispatches: dispatches.clone(),
            },
        );

        // No dispatch thread: the test drives the loop by hand.
        let inner = Inner::new(factory, test_config(), Handle::current());
        for _ in 0..10 {
            inner.signal(&edge);
        }
        assert_eq!(inner.queue.lock().len(), 1);

        let next = inner.queue.lock().pop().unwrap();
        inner.dispatch(&next);

        assert_eq!(dispatches.load(Ordering::SeqCst), 1);
        assert!(inner.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn new_requests_signal_their_target() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let edge = EdgeCell::new(
            GraphRef::new("counting", 0),
            Counting {
                dispatches: Arc::new(AtomicUsize::new(0)),
            },
        );
        let inner = Inner::new(factory, test_config(), Handle::current());

        let pipe = {
            let mut state = inner.state.lock();
            inner.new_pipe(&mut state, &edge, None, EdgeRequest::complete())
        };
        assert_eq!(inner.state.lock().counts(), (1, 0));
        assert_eq!(inner.queue.lock().len(), 1);

        let next = inner.queue.lock().pop().unwrap();
        inner.dispatch(&next);

        assert!(pipe.receiver.receive());
        assert!(pipe.receiver.status().is_success());
        assert_eq!(inner.state.lock().counts(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unanswered_request_fails_edge() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let failed_with = Arc::new(Mutex::new(None));
        let r = GraphRef::new("stubborn", 0);
        factory.insert(
            r.clone(),
            Stubborn {
                failed_with: failed_with.clone(),
            },
        );
        let scheduler = Scheduler::with_config(factory, test_config(), Handle::current()).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.build(CancellationToken::new(), &r),
        )
        .await
        .expect("build hung")
        .unwrap_err();

        assert!(matches!(err, SolverError::Internal(_)));
        assert!(err.to_string().contains("leaving incoming open"));
        // Waits for the failing dispatch to finish.
        assert_eq!(scheduler.open_requests(), (0, 0));
        assert!(failed_with.lock().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_outgoing_fails_edge() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let failed = Arc::new(AtomicUsize::new(0));
        let r = GraphRef::new("abandoning", 0);
        factory.insert(
            r.clone(),
            Abandoning {
                failed: failed.clone(),
            },
        );
        let scheduler = Scheduler::with_config(factory, test_config(), Handle::current()).unwrap();

        scheduler
            .build(CancellationToken::new(), &r)
            .await
            .unwrap_err();

        // Failing the edge cancels the leaf it walked away from, and the
        // leaf's answer clears the last request.
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.open_requests() != (0, 0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("abandoned request was never reclaimed");
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_edge_fails_without_stalling_others() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let bad = GraphRef::new("exploding", 0);
        let good = GraphRef::new("good", 0);
        factory.insert(
            bad.clone(),
            Exploding {
                panic_when_failed: false,
            },
        );
        factory.insert_op(
            good.clone(),
            FnOp::new("good", vec![], |_, _| async { Ok(serde_json::json!("ok")) }),
        );
        let scheduler =
            Scheduler::with_config(factory.clone(), test_config(), Handle::current()).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.build(CancellationToken::new(), &bad),
        )
        .await
        .expect("build hung")
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
        assert!(err.to_string().contains("edge panicked during dispatch: edge bug"));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.build(CancellationToken::new(), &good),
        )
        .await
        .expect("build hung")
        .unwrap();
        assert_eq!(result.output, serde_json::json!("ok"));
        assert_eq!(scheduler.open_requests(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unfailable_edge_stops_scheduler() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let r = GraphRef::new("exploding", 0);
        factory.insert(
            r.clone(),
            Exploding {
                panic_when_failed: true,
            },
        );
        let scheduler = Scheduler::with_config(factory, test_config(), Handle::current()).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.build(CancellationToken::new(), &r),
        )
        .await
        .expect("build hung")
        .unwrap_err();
        assert!(matches!(err, SolverError::Stopped));
    }

    #[tokio::test]
    async fn signals_after_stop_are_dropped() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let edge = EdgeCell::new(
            GraphRef::new("counting", 0),
            Counting {
                dispatches: Arc::new(AtomicUsize::new(0)),
            },
        );
        let inner = Inner::new(factory, test_config(), Handle::current());

        inner.shutdown.cancel();
        inner.signal(&edge);

        assert!(inner.queue.lock().is_empty());
        assert_eq!(Arc::strong_count(&edge), 1);
    }

    #[tokio::test]
    async fn unknown_root_is_rejected() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let scheduler = Scheduler::with_config(factory, test_config(), Handle::current()).unwrap();

        let err = scheduler
            .build(CancellationToken::new(), &GraphRef::new("missing", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::InvalidRequest(_)));
        assert_eq!(scheduler.open_requests(), (0, 0));
    }

    #[tokio::test]
    async fn stopped_scheduler_rejects_builds() {
        let factory = Arc::new(MemoryEdgeFactory::new());
        let scheduler = Scheduler::with_config(factory, test_config(), Handle::current()).unwrap();
        scheduler.stop();
        scheduler.stop();

        let err = scheduler
            .build(CancellationToken::new(), &GraphRef::new("any", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::Stopped));
    }
}
