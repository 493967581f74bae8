//! Quiescence Barrier
//!
//! Counts outstanding asynchronous tasks for one scope and lets a caller wait
//! until the count returns to zero.
//!
//! # Guarantees
//!
//! - The count never goes below zero. A decrement on an idle barrier is logged
//!   and rejected.
//! - Tasks started through [`Barrier::spawn`] hold a [`BarrierGuard`], so the
//!   count is released exactly once on success, error and panic alike.
//! - Waiters are woken only when the count reaches zero, not on every change.
//!
//! A session owns three independent barriers (session work, object sync and
//! REST work). They never share state.

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Result, SessionError};

/// Scheduling-to-start delay above which a task start is reported as stalled.
pub const STALL_THRESHOLD: Duration = Duration::from_millis(31);

#[derive(Debug, Clone)]
pub struct Barrier {
    inner: Arc<BarrierInner>,
}

#[derive(Debug)]
struct BarrierInner {
    scope: &'static str,
    count: watch::Sender<usize>,
}

impl Barrier {
    pub fn new(scope: &'static str) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(BarrierInner { scope, count }),
        }
    }

    pub fn scope(&self) -> &'static str {
        self.inner.scope
    }

    pub fn count(&self) -> usize {
        *self.inner.count.borrow()
    }

    pub fn increment(&self) {
        self.inner.count.send_if_modified(|count| {
            *count += 1;
            false
        });
    }

    pub fn decrement(&self) -> Result<()> {
        let mut underflow = false;
        self.inner.count.send_if_modified(|count| {
            if *count == 0 {
                underflow = true;
                return false;
            }
            *count -= 1;
            *count == 0
        });

        if underflow {
            error!(scope = self.inner.scope, "Decrement on idle barrier");
            return Err(SessionError::Internal(format!(
                "barrier '{}' decremented below zero",
                self.inner.scope
            )));
        }
        Ok(())
    }

    /// Count one task until the returned guard is dropped.
    pub fn enter(&self) -> BarrierGuard {
        self.increment();
        BarrierGuard {
            barrier: self.clone(),
        }
    }

    /// Block until the count is zero or `cancel` fires.
    pub async fn wait_until_zero(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let mut rx = self.inner.count.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            idle = rx.wait_for(|count| *count == 0) => idle
                .map(|_| ())
                .map_err(|_| SessionError::Internal(format!("barrier '{}' closed", self.inner.scope))),
        }
    }

    /// Spawn `fut` as a counted task.
    ///
    /// The count is taken before scheduling. When `limiter` is given the task
    /// waits for a permit before running; it stays counted while it waits.
    pub fn spawn<F>(
        &self,
        label: &'static str,
        limiter: Option<Arc<Semaphore>>,
        fut: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.enter();
        let scheduled = Instant::now();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(limiter) => limiter.acquire_owned().await.ok(),
                None => None,
            };
            report_stall(guard.barrier.scope(), label, scheduled.elapsed());
            fut.await;
            drop(guard);
        })
    }
}

/// The three scopes a session quiesces independently.
#[derive(Debug, Clone)]
pub struct Barriers {
    /// Every queued request and dispatched callback.
    pub session: Barrier,
    /// Layout and data fetches of subscribed objects.
    pub objects: Barrier,
    /// Work on the REST side channel.
    pub rest: Barrier,
}

impl Default for Barriers {
    fn default() -> Self {
        Self {
            session: Barrier::new("session"),
            objects: Barrier::new("object-sync"),
            rest: Barrier::new("rest"),
        }
    }
}

/// Releases one count on drop.
#[derive(Debug)]
pub struct BarrierGuard {
    barrier: Barrier,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        let _ = self.barrier.decrement();
    }
}

fn report_stall(scope: &'static str, label: &'static str, stalled: Duration) {
    if stalled > STALL_THRESHOLD {
        warn!(
            scope,
            task = label,
            stalled_ms = stalled.as_millis() as u64,
            "Task start stalled, workers may be saturated"
        );
    }
}

/// Run `fut`, converting a panic into [`SessionError::Panic`].
pub async fn catch_panic<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(SessionError::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
