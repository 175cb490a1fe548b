//! Solver Core
//!
//! This crate provides the scheduling core of a build-graph solver. It
//! implements:
//!
//! - Request pipes between the parties of a computation
//! - The edge contract that vertex state machines implement
//! - A single-threaded dispatch loop with invariant checks
//! - A content-addressable index of equivalent edges
//!
//! # Architecture
//!
//! - `pipe`: Request/response channels with cancellation and callbacks
//! - `solver`: Edges, the dispatch queue, the scheduler and the index
//! - `config`: Scheduler settings
//! - `error`: The error type shared by every pipe
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use solver_core::solver::{FnOp, GraphRef, MemoryEdgeFactory, Scheduler};
//! use tokio_util::sync::CancellationToken;
//!
//! let factory = Arc::new(MemoryEdgeFactory::new());
//! let source = GraphRef::new("source", 0);
//! factory.insert_op(source.clone(), FnOp::new("source", vec![], |_, _| async {
//!     Ok(serde_json::json!("hello"))
//! }));
//!
//! let scheduler = Scheduler::new(factory)?;
//! let result = scheduler.build(CancellationToken::new(), &source).await?;
//! assert_eq!(result.output, "hello");
//! ```

pub mod config;
pub mod error;
pub mod pipe;
pub mod solver;

pub use config::SchedulerConfig;
pub use error::{ErrorKind, Result, SolverError};
pub use solver::{GraphRef, Scheduler};
