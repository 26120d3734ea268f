//! Retry dispatch with exponential backoff and deadline awareness.

use crate::{AsyncContext, Error, Executor, Outcome};
use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Backoff schedule for retryable operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    /// The same delay before every retry.
    Fixed { delay: Duration, max_retries: u32 },
    /// Delay doubles with every retry: `base * 2^(retry_count - 1)`.
    Exponential { base: Duration, max_retries: u32 },
}

impl RetryStrategy {
    /// Delay to wait before the given retry (1-indexed).
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            Self::Fixed { delay, .. } => *delay,
            Self::Exponential { base, .. } => {
                let shift = retry_count.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << shift)
            }
        }
    }

    /// Maximum number of retries permitted after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Fixed { max_retries, .. } => *max_retries,
            Self::Exponential { max_retries, .. } => *max_retries,
        }
    }
}

/// Terminal classification reported to the retry-event hook.
///
/// The hook is never invoked for success without any retry: first-attempt
/// success is the expected common case and must not add overhead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryEvent {
    /// The operation eventually succeeded after at least one retry.
    SuccessAfterRetry,
    /// The operation failed after at least one retry (including exhaustion
    /// and deadline verdicts).
    FailureAfterRetry,
    /// The very first attempt failed with a non-retryable result.
    NonRetriableFailure,
}

/// Observer invoked with the terminal [RetryEvent] of a dispatched operation.
pub type RetryHook = Arc<dyn Fn(RetryEvent) + Send + Sync>;

/// A retryable operation: invoked once per attempt with the context and a
/// single-use [Attempt] token through which it reports its outcome.
pub type Operation<Req, Resp, E> =
    Arc<dyn Fn(Arc<AsyncContext<Req, Resp, E>>, Attempt<Req, Resp, E>) + Send + Sync>;

/// Executes an operation and, whenever its outcome is flagged retryable,
/// resubmits it to the executor after a strategy-determined delay, subject to
/// the retry cap and the context's absolute expiration.
///
/// Attempt 0 always runs inline on the dispatching thread; only retries pass
/// through the executor's delay queue.
pub struct RetryDispatcher {
    executor: Arc<Executor>,
    strategy: RetryStrategy,
    hook: Option<RetryHook>,
}

impl RetryDispatcher {
    /// Create a dispatcher with no retry-event hook.
    pub fn new(executor: Arc<Executor>, strategy: RetryStrategy) -> Arc<Self> {
        Arc::new(Self {
            executor,
            strategy,
            hook: None,
        })
    }

    /// Create a dispatcher that reports terminal retry events to `hook`.
    pub fn with_hook(
        executor: Arc<Executor>,
        strategy: RetryStrategy,
        hook: RetryHook,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            strategy,
            hook: Some(hook),
        })
    }

    /// Run `op` now, retrying per the strategy until success, a non-retryable
    /// failure, retry exhaustion, or deadline expiry.
    pub fn dispatch<Req, Resp, E>(
        self: &Arc<Self>,
        context: Arc<AsyncContext<Req, Resp, E>>,
        op: Operation<Req, Resp, E>,
    ) where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
        E: From<Error> + Debug + Send + 'static,
    {
        let attempt = Attempt {
            dispatcher: self.clone(),
            context: context.clone(),
            op: op.clone(),
        };
        (op.as_ref())(context, attempt);
    }

    fn emit(&self, event: RetryEvent) {
        if let Some(hook) = &self.hook {
            (hook.as_ref())(event);
        }
    }

    fn reschedule<Req, Resp, E>(
        self: &Arc<Self>,
        context: Arc<AsyncContext<Req, Resp, E>>,
        op: Operation<Req, Resp, E>,
        cause: E,
    ) where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
        E: From<Error> + Debug + Send + 'static,
    {
        let retries = context.increment_retries();
        let max_retries = self.strategy.max_retries();
        if retries > max_retries {
            debug!(activity = %context.activity_id(), ?cause, retries = max_retries, "retries exhausted");
            self.emit(RetryEvent::FailureAfterRetry);
            context.finish(Err(Error::ExhaustedRetries(max_retries).into()));
            return;
        }
        let now = Instant::now();
        let backoff = self.strategy.delay(retries);
        if let Some(expiration) = context.expiration() {
            if now >= expiration {
                self.emit(RetryEvent::FailureAfterRetry);
                context.finish(Err(Error::Expired.into()));
                return;
            }
            if expiration - now <= backoff {
                self.emit(RetryEvent::FailureAfterRetry);
                context.finish(Err(Error::NotEnoughTimeRemaining.into()));
                return;
            }
        }
        debug!(activity = %context.activity_id(), ?cause, retries, ?backoff, "scheduling retry");
        let dispatcher = self.clone();
        let retry_context = context.clone();
        let retry_op = op.clone();
        let scheduled = self.executor.schedule_at(
            move || {
                if retry_context.is_cancelled() {
                    retry_context.finish(Err(Error::Cancelled.into()));
                    return;
                }
                let attempt = Attempt {
                    dispatcher: dispatcher.clone(),
                    context: retry_context.clone(),
                    op: retry_op.clone(),
                };
                (retry_op.as_ref())(retry_context.clone(), attempt);
            },
            now + backoff,
        );
        if let Err(error) = scheduled {
            self.emit(RetryEvent::FailureAfterRetry);
            context.finish(Err(error.into()));
        }
    }
}

/// Single-use completion token handed to each attempt of a retryable
/// operation. Reporting an outcome consumes the token, so an attempt cannot
/// complete twice.
pub struct Attempt<Req, Resp, E> {
    dispatcher: Arc<RetryDispatcher>,
    context: Arc<AsyncContext<Req, Resp, E>>,
    op: Operation<Req, Resp, E>,
}

impl<Req, Resp, E> Attempt<Req, Resp, E>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
    E: From<Error> + Debug + Send + 'static,
{
    /// Report the outcome of this attempt.
    ///
    /// Success and terminal failure finish the context immediately; a
    /// retryable failure re-enters the executor's delay queue (or converts
    /// into a terminal verdict when the cap or deadline forbids another try).
    pub fn complete(self, outcome: Outcome<E>) {
        let Self {
            dispatcher,
            context,
            op,
        } = self;
        match outcome {
            Outcome::Success => {
                if context.retry_count() > 0 {
                    dispatcher.emit(RetryEvent::SuccessAfterRetry);
                }
                context.finish(Ok(()));
            }
            Outcome::Failure(error) => {
                dispatcher.emit(if context.retry_count() > 0 {
                    RetryEvent::FailureAfterRetry
                } else {
                    RetryEvent::NonRetriableFailure
                });
                context.finish(Err(error));
            }
            Outcome::Retry(cause) => dispatcher.reschedule(context, op, cause),
        }
    }
}
