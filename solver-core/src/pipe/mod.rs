//! Request Pipes
//!
//! A pipe connects two parties: one that needs an answer (the receiver)
//! and one that produces it (the sender). The request payload is fixed at
//! creation; the status evolves through zero or more partial updates to
//! exactly one terminal value or error.
//!
//! # Concepts
//!
//! ## Polling, not waiting
//!
//! Receivers never block. [`PipeReceiver::receive`] returns whether
//! anything new was published, which lets a single loop poll many pipes
//! cheaply and only act on the ones that moved.
//!
//! ## Callbacks
//!
//! Instead of being polled blindly, a pipe tells interested parties when
//! to look: `on_update` for partial progress, `on_send_completion` once on
//! the terminal status, and `on_receive_completion` once when the receiver
//! cancels.
//!
//! ## Computation-backed pipes
//!
//! [`Pipe::with_function`] turns an async function of a cancellation
//! token into a pipe whose sender is driven by that function.

mod channel;
mod function;
mod status;

pub use channel::{Pipe, PipeId, PipeReceiver, PipeSender};
pub use status::{Request, Status};
