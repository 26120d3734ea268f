//! Execute and retry asynchronous work on a bounded scheduler.
//!
//! This crate provides the execution substrate for fan-out/fan-in protocols:
//! a bounded thread-pool [Executor] with a timer path for delayed work, a
//! single-shot continuation type ([AsyncContext]) that carries one
//! request/response pair to a terminal callback, and a [RetryDispatcher]
//! that resubmits retryable operations with growing delay until success, a
//! terminal failure, retry exhaustion, or deadline expiry.
//!
//! # Contracts
//!
//! The components are small but their contracts are load-bearing:
//! - An [AsyncContext]'s terminal callback fires exactly once over the
//!   object's lifetime, no matter how many completions race to finish it.
//! - The [Executor] only accepts work while running; a full ready queue is
//!   backpressure ([Error::QueueFull]), never silent loss.
//! - The [RetryDispatcher] runs the first attempt inline and schedules every
//!   subsequent attempt through the executor's delay queue, bounded by both
//!   the strategy's retry cap and the context's absolute expiration.
//!
//! # Example
//!
//! ```rust
//! use splitkey_executor::{AsyncContext, Config, Executor, Priority};
//! use std::sync::mpsc;
//!
//! let executor = Executor::new(Config::default());
//! executor.start().unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! let context: std::sync::Arc<AsyncContext<u32, u32, splitkey_executor::Error>> =
//!     AsyncContext::new(42, Box::new(move |cx| {
//!         tx.send(cx.result().unwrap()).unwrap();
//!     }));
//! executor
//!     .schedule(
//!         {
//!             let context = context.clone();
//!             move || {
//!                 context.set_response(*context.request() + 1);
//!                 context.finish(Ok(()));
//!             }
//!         },
//!         Priority::Normal,
//!     )
//!     .unwrap();
//! assert_eq!(rx.recv().unwrap(), Ok(()));
//! executor.stop().unwrap();
//! ```

use thiserror::Error;

mod context;
pub use context::{AsyncContext, Callback, ChunkCallback, StreamingContext};
mod pool;
pub use pool::{Config, DelayHandle, Executor, Priority};
mod retry;
pub use retry::{Attempt, Operation, RetryDispatcher, RetryEvent, RetryHook, RetryStrategy};

/// Errors that can occur when interacting with the scheduler and retry
/// framework.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("queue full")]
    QueueFull,
    #[error("not running")]
    NotRunning,
    #[error("already started")]
    AlreadyStarted,
    #[error("cancelled")]
    Cancelled,
    #[error("expired")]
    Expired,
    #[error("retries exhausted after {0} retries")]
    ExhaustedRetries(u32),
    #[error("not enough time remaining before expiration")]
    NotEnoughTimeRemaining,
    #[error("stream marked done")]
    StreamDone,
}

/// Verdict reported by one attempt of a retryable operation.
///
/// `Retry` is never a terminal state: it is only ever observed by the
/// [RetryDispatcher], which either reschedules the operation or converts the
/// verdict into a terminal failure ([Error::ExhaustedRetries],
/// [Error::Expired], or [Error::NotEnoughTimeRemaining]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<E> {
    /// The attempt succeeded; the context's response (if any) has been set.
    Success,
    /// The attempt failed terminally; retrying cannot help.
    Failure(E),
    /// The attempt failed transiently and is eligible for automatic retry.
    Retry(E),
}
