//! Lazily started, run-once computations shared between awaiters.
//!
//! A [`Memo`] spawns its computation on first request and hands every caller a
//! clone of the same shared future. The work runs in its own task, so it
//! finishes even if the caller that started it goes away; only
//! [`TaskTracker::abort_all`] stops it.

use crate::error::{Result, SpeechError};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::{AbortHandle, JoinHandle};

pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Tasks belonging to one speech session, aborted together when it ends.
#[derive(Clone, Default)]
pub struct TaskTracker {
    inner: Arc<Mutex<Tracked>>,
}

#[derive(Default)]
struct Tracked {
    handles: Vec<AbortHandle>,
    closed: bool,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        // Closed check and registration happen under one lock.
        let mut tracked = match self.inner.lock() {
            Ok(tracked) => tracked,
            Err(poisoned) => poisoned.into_inner(),
        };
        let handle = tokio::spawn(future);
        if tracked.closed {
            handle.abort();
        } else {
            tracked.handles.retain(|h| !h.is_finished());
            tracked.handles.push(handle.abort_handle());
        }
        handle
    }

    /// Abort everything spawned so far; later spawns are aborted at once.
    pub fn abort_all(&self) {
        let mut tracked = match self.inner.lock() {
            Ok(tracked) => tracked,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracked.closed = true;
        for handle in tracked.handles.drain(..) {
            handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|t| t.closed).unwrap_or(true)
    }
}

pub struct Memo<T> {
    cell: OnceLock<SharedResult<T>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared result, starting the computation if nobody has yet. `start`
    /// runs at most once over the memo's lifetime.
    pub fn get_or_start<F>(&self, tasks: &TaskTracker, start: F) -> SharedResult<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
    {
        self.cell
            .get_or_init(|| {
                let handle = tasks.spawn(start());
                async move { handle.await.map_err(SpeechError::from)? }
                    .boxed()
                    .shared()
            })
            .clone()
    }

    pub fn is_started(&self) -> bool {
        self.cell.get().is_some()
    }
}
