//! Per-call execution context
//!
//! Every remote call runs inside a `RequestContext`: a cancellation token
//! derived from the session's base token, a deadline taken from the session
//! request timeout, the call options, and a change scope that accumulates the
//! handles the call invalidated.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::rpc::ChangeList;

/// Per-call switches carried down the call chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Do not retry "generic aborted" responses for this call.
    pub retries_disabled: bool,
}

/// Change accumulator owned by one call.
#[derive(Debug, Clone, Default)]
pub struct ChangeScope(Arc<Mutex<ChangeList>>);

impl ChangeScope {
    pub fn record(&self, changes: ChangeList) {
        if !changes.is_empty() {
            self.0.lock().merge(changes);
        }
    }

    /// Take everything accumulated so far, leaving the scope empty.
    pub fn take(&self) -> ChangeList {
        std::mem::take(&mut *self.0.lock())
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    options: CallOptions,
    changes: ChangeScope,
}

impl RequestContext {
    /// Derive a fresh context bounded by `timeout` from the base token.
    pub fn derive(base: &CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel: base.child_token(),
            deadline: Instant::now() + timeout,
            timeout,
            options: CallOptions::default(),
            changes: ChangeScope::default(),
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn without_retries(self) -> Self {
        self.with_options(CallOptions {
            retries_disabled: true,
        })
    }

    pub fn options(&self) -> CallOptions {
        self.options
    }

    pub fn retries_disabled(&self) -> bool {
        self.options.retries_disabled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn changes(&self) -> &ChangeScope {
        &self.changes
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run `fut` bounded by this context's cancellation and deadline.
    ///
    /// Cancellation wins over timeout when both are ready.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            result = tokio::time::timeout_at(self.deadline, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(SessionError::Timeout(self.timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_times_out() {
        let base = CancellationToken::new();
        let ctx = RequestContext::derive(&base, Duration::from_millis(20));
        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_base_cancel_reaches_derived_context() {
        let base = CancellationToken::new();
        let ctx = RequestContext::derive(&base, Duration::from_secs(30));

        let canceller = base.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_poll() {
        let base = CancellationToken::new();
        base.cancel();
        let ctx = RequestContext::derive(&base, Duration::from_secs(30));
        let result: Result<u32> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[test]
    fn test_change_scope_take_empties() {
        let scope = ChangeScope::default();
        scope.record(ChangeList::new([1], []));
        scope.record(ChangeList::new([2], [1]));
        assert_eq!(scope.take(), ChangeList::new([2], [1]));
        assert!(scope.take().is_empty());
    }

    #[test]
    fn test_options() {
        let base = CancellationToken::new();
        let ctx = RequestContext::derive(&base, Duration::from_secs(1));
        assert!(!ctx.retries_disabled());
        assert!(ctx.without_retries().retries_disabled());
    }
}
