//! Pipe handles.
//!
//! A pipe is shared between a [`PipeSender`] and a [`PipeReceiver`]. The
//! sender publishes status snapshots; the receiver pulls the latest one
//! with [`PipeReceiver::receive`], which never blocks. Each publish bumps a
//! sequence number, so a receiver only reports a change when the sender
//! actually published something since the last pull.
//!
//! Callbacks are the only way a pipe reaches out to the rest of the
//! system. They run on whatever thread triggered them and never while a
//! pipe lock is held.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::status::{Request, Status};
use crate::error::{ErrorKind, Result, SolverError};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Unique identifier for a pipe, shared by both of its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(u64);

impl PipeId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Latest status published by the sender.
struct Published<V> {
    seq: u64,
    status: Status<V>,
}

/// Latest status pulled by the receiver.
struct Observed<V> {
    seen: u64,
    status: Status<V>,
}

#[derive(Default)]
struct Callbacks {
    on_send_completion: Option<Callback>,
    on_update: Option<Callback>,
    on_receive_completion: Option<Callback>,
}

struct Shared<Req, V> {
    id: PipeId,
    payload: Req,
    canceled: AtomicBool,
    published: Mutex<Published<V>>,
    observed: Mutex<Observed<V>>,
    callbacks: Mutex<Callbacks>,
}

impl<Req, V> Shared<Req, V> {
    fn fire(&self, pick: impl FnOnce(&Callbacks) -> Option<Callback>) {
        // Clone out so the callback runs without the lock held.
        let callback = pick(&self.callbacks.lock());
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Both ends of a freshly created pipe.
pub struct Pipe<Req, V> {
    pub sender: PipeSender<Req, V>,
    pub receiver: PipeReceiver<Req, V>,
}

impl<Req, V> Pipe<Req, V>
where
    V: Clone + Default,
{
    /// Create a pipe carrying `payload` as its request.
    pub fn new(payload: Req) -> Self {
        let shared = Arc::new(Shared {
            id: PipeId::next(),
            payload,
            canceled: AtomicBool::new(false),
            published: Mutex::new(Published {
                seq: 0,
                status: Status::default(),
            }),
            observed: Mutex::new(Observed {
                seen: 0,
                status: Status::default(),
            }),
            callbacks: Mutex::new(Callbacks::default()),
        });

        Self {
            sender: PipeSender {
                shared: Arc::clone(&shared),
            },
            receiver: PipeReceiver { shared },
        }
    }
}

impl<Req, V> Pipe<Req, V> {
    pub fn id(&self) -> PipeId {
        self.sender.shared.id
    }

    /// Called once, when the sender publishes a terminal status.
    pub fn set_on_send_completion<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.sender.shared.callbacks.lock().on_send_completion = Some(Arc::new(f));
    }

    /// Called for every non-terminal update the sender publishes.
    pub fn set_on_update<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.sender.shared.callbacks.lock().on_update = Some(Arc::new(f));
    }

    /// Called once, when the receiver cancels the request.
    pub fn set_on_receive_completion<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.sender.shared.callbacks.lock().on_receive_completion = Some(Arc::new(f));
    }
}

/// The fulfilling end of a pipe.
pub struct PipeSender<Req, V> {
    shared: Arc<Shared<Req, V>>,
}

impl<Req, V> PipeSender<Req, V>
where
    V: Clone + Default,
{
    pub fn id(&self) -> PipeId {
        self.shared.id
    }

    pub fn payload(&self) -> &Req {
        &self.shared.payload
    }

    /// Whether the awaiting side has asked to cancel.
    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::SeqCst)
    }

    /// The request together with its current cancellation flag.
    pub fn request(&self) -> Request<Req>
    where
        Req: Clone,
    {
        Request {
            payload: self.shared.payload.clone(),
            canceled: self.is_canceled(),
        }
    }

    /// The status as this side last published it.
    pub fn status(&self) -> Status<V> {
        self.shared.published.lock().status.clone()
    }

    /// Publish a partial value without completing the request.
    pub fn update(&self, value: V) -> Result<()> {
        {
            let mut published = self.shared.published.lock();
            if published.status.completed {
                return Err(SolverError::PipeClosed);
            }
            published.status.value = value;
            published.seq += 1;
        }
        self.shared.fire(|cb| cb.on_update.clone());
        Ok(())
    }

    /// Publish the terminal status.
    ///
    /// An error of kind [`ErrorKind::Canceled`] on a request that was
    /// canceled marks the status as canceled.
    pub fn finalize(&self, result: Result<V>) -> Result<()> {
        {
            let mut published = self.shared.published.lock();
            if published.status.completed {
                return Err(SolverError::PipeClosed);
            }
            let status = &mut published.status;
            match result {
                Ok(value) => {
                    status.value = value;
                    status.err = None;
                }
                Err(err) => {
                    status.value = V::default();
                    status.canceled = err.kind() == ErrorKind::Canceled && self.is_canceled();
                    status.err = Some(err);
                }
            }
            status.completed = true;
            published.seq += 1;
        }
        self.shared.fire(|cb| cb.on_send_completion.clone());
        Ok(())
    }
}

impl<Req, V> Clone for PipeSender<Req, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, V> fmt::Debug for PipeSender<Req, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeSender")
            .field("id", &self.shared.id)
            .finish()
    }
}

/// The awaiting end of a pipe.
///
/// Clones share the same observed status: pulling through one clone
/// consumes the change for all of them.
pub struct PipeReceiver<Req, V> {
    shared: Arc<Shared<Req, V>>,
}

impl<Req, V> PipeReceiver<Req, V>
where
    V: Clone + Default,
{
    pub fn id(&self) -> PipeId {
        self.shared.id
    }

    pub fn payload(&self) -> &Req {
        &self.shared.payload
    }

    /// Pull the latest published status.
    ///
    /// Returns true if the sender published anything since the last pull.
    pub fn receive(&self) -> bool {
        let mut observed = self.shared.observed.lock();
        let published = self.shared.published.lock();
        if published.seq == observed.seen {
            return false;
        }
        observed.seen = published.seq;
        observed.status = published.status.clone();
        true
    }

    /// The status as of the last [`receive`](Self::receive).
    pub fn status(&self) -> Status<V> {
        self.shared.observed.lock().status.clone()
    }

    /// Ask the sender to stop. Does not wait; the terminal status arrives
    /// through the usual channel once the sender honors it.
    pub fn cancel(&self) {
        if self.shared.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.fire(|cb| cb.on_receive_completion.clone());
    }

    /// Whether both handles belong to the same pipe.
    pub fn same_pipe(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<Req, V> Clone for PipeReceiver<Req, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, V> fmt::Debug for PipeReceiver<Req, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReceiver")
            .field("id", &self.shared.id)
            .finish()
    }
}
