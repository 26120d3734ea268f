//! Single-shot continuations carrying one request/response pair.

use crate::Error;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};
use tracing::warn;
use uuid::Uuid;

/// Terminal callback invoked exactly once when a context finishes.
pub type Callback<Req, Resp, E> = Box<dyn FnOnce(&AsyncContext<Req, Resp, E>) + Send>;

/// A single-shot, cancellable, expirable, retry-counted continuation.
///
/// The request is shared and read-only for the context's whole lifetime
/// (multiple hops may read it); the response is exclusively owned by
/// whichever hop currently holds the continuation and is transferred on each
/// hand-off via [AsyncContext::take_response].
///
/// The terminal callback fires exactly once: the first call to
/// [AsyncContext::finish] consumes it, and every later call is a no-op that
/// returns `false`.
pub struct AsyncContext<Req, Resp, E> {
    request: Arc<Req>,
    response: Mutex<Option<Resp>>,
    result: Mutex<Option<Result<(), E>>>,
    callback: Mutex<Option<Callback<Req, Resp, E>>>,
    retry_count: AtomicU32,
    expiration: Option<Instant>,
    cancelled: AtomicBool,
    activity_id: Uuid,
    parent_activity_id: Option<Uuid>,
}

impl<Req, Resp, E> AsyncContext<Req, Resp, E> {
    /// Create a context with no expiration and no parent.
    pub fn new(request: Req, callback: Callback<Req, Resp, E>) -> Arc<Self> {
        Self::with_options(Arc::new(request), None, None, callback)
    }

    /// Create a context with an explicit expiration, parent activity, or a
    /// request already shared with other hops.
    pub fn with_options(
        request: Arc<Req>,
        expiration: Option<Instant>,
        parent_activity_id: Option<Uuid>,
        callback: Callback<Req, Resp, E>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request,
            response: Mutex::new(None),
            result: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
            retry_count: AtomicU32::new(0),
            expiration,
            cancelled: AtomicBool::new(false),
            activity_id: Uuid::new_v4(),
            parent_activity_id,
        })
    }

    /// Shared read-only handle to the request.
    pub fn request(&self) -> Arc<Req> {
        self.request.clone()
    }

    /// Hand the response to this context. The previous response (if any) is
    /// replaced; hops hand off ownership with [AsyncContext::take_response].
    pub fn set_response(&self, response: Resp) {
        *self.response.lock().unwrap() = Some(response);
    }

    /// Take exclusive ownership of the response, leaving the slot empty.
    pub fn take_response(&self) -> Option<Resp> {
        self.response.lock().unwrap().take()
    }

    /// Finish the context, synchronously invoking the terminal callback.
    ///
    /// Returns whether this call won: exactly one caller over the context's
    /// lifetime observes `true`, and only the winner's result is recorded.
    pub fn finish(self: &Arc<Self>, result: Result<(), E>) -> bool {
        let callback = {
            let mut slot = self.callback.lock().unwrap();
            match slot.take() {
                Some(callback) => callback,
                None => {
                    warn!(activity = %self.activity_id, "finish after terminal callback");
                    return false;
                }
            }
        };
        *self.result.lock().unwrap() = Some(result);
        callback(self);
        true
    }

    /// Whether [AsyncContext::finish] has already been called.
    pub fn is_finished(&self) -> bool {
        self.callback.lock().unwrap().is_none()
    }

    /// Request cancellation from any thread. Idempotent.
    ///
    /// Cancellation is cooperative: every continuation point must check
    /// [AsyncContext::is_cancelled] before doing further work, and a
    /// cancelled context must still finish exactly once (with
    /// [Error::Cancelled] mapped into its error type).
    pub fn try_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Absolute expiration of this context, if any.
    pub fn expiration(&self) -> Option<Instant> {
        self.expiration
    }

    /// Whether the context has passed its expiration at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiration.is_some_and(|expiration| now >= expiration)
    }

    /// Number of retries recorded against this context.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Record one more retry, returning the new count.
    pub fn increment_retries(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unique id for this hop of work.
    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Activity id of the hop that spawned this one, if any.
    pub fn parent_activity_id(&self) -> Option<Uuid> {
        self.parent_activity_id
    }
}

impl<Req, Resp, E: Clone> AsyncContext<Req, Resp, E> {
    /// The terminal result, if the context has finished.
    pub fn result(&self) -> Option<Result<(), E>> {
        self.result.lock().unwrap().clone()
    }
}

/// Per-chunk callback for [StreamingContext].
///
/// Invoked with `false` after every enqueued response and exactly once with
/// `true` when the stream is fully drained and marked done.
pub type ChunkCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Streaming variant of [AsyncContext]: a pending-request queue feeding a
/// producer, a response queue feeding a consumer, and a done flag.
///
/// The terminal callback of the underlying context still fires exactly once;
/// the per-chunk callback is additional and never terminal.
pub struct StreamingContext<Req, Resp, E> {
    context: Arc<AsyncContext<Req, Resp, E>>,
    pending: Mutex<VecDeque<Req>>,
    responses: Mutex<VecDeque<Resp>>,
    done: AtomicBool,
    finish_delivered: AtomicBool,
    chunk_callback: ChunkCallback,
}

impl<Req, Resp, E> StreamingContext<Req, Resp, E> {
    /// Wrap a context with streaming queues and a per-chunk callback.
    pub fn new(context: Arc<AsyncContext<Req, Resp, E>>, chunk_callback: ChunkCallback) -> Arc<Self> {
        Arc::new(Self {
            context,
            pending: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            finish_delivered: AtomicBool::new(false),
            chunk_callback,
        })
    }

    /// The underlying single-shot context.
    pub fn context(&self) -> &Arc<AsyncContext<Req, Resp, E>> {
        &self.context
    }

    /// Queue a follow-up request. Fails once the stream is marked done.
    pub fn try_push_request(&self, request: Req) -> Result<(), Error> {
        if self.is_done() {
            return Err(Error::StreamDone);
        }
        self.pending.lock().unwrap().push_back(request);
        Ok(())
    }

    /// Dequeue the next pending request, if any.
    pub fn try_next_request(&self) -> Option<Req> {
        self.pending.lock().unwrap().pop_front()
    }

    /// Enqueue a response chunk and notify the consumer.
    pub fn push_response(&self, response: Resp) {
        self.responses.lock().unwrap().push_back(response);
        (self.chunk_callback)(false);
    }

    /// Dequeue the next response chunk, if any.
    ///
    /// Once the stream is marked done and the last chunk has been taken, the
    /// per-chunk callback is invoked one final time with `is_finish = true`.
    pub fn try_next_response(&self) -> Option<Resp> {
        let response = self.responses.lock().unwrap().pop_front();
        if self.is_done() {
            self.maybe_deliver_finish();
        }
        response
    }

    /// Mark the producer side of the stream as complete. Idempotent.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.maybe_deliver_finish();
    }

    /// Whether the producer side has been marked complete.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn maybe_deliver_finish(&self) {
        if !self.responses.lock().unwrap().is_empty() {
            return;
        }
        if self
            .finish_delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (self.chunk_callback)(true);
        }
    }
}
