//! Reconnect supervisor
//!
//! Takes over when the transport closes unexpectedly: redials on a backoff
//! schedule, then replays what the session had subscribed.
//!
//! ```text
//! Connected ──close──► Disconnected ──► Reconnecting ──┬──► Connected
//!                                                      └──► Failed
//! ```
//!
//! Cycles never overlap. Callers that only need the connection back wait on
//! the in-flight gate without starting a cycle of their own.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::barrier::{Barrier, BarrierGuard};
use crate::error::{Result, SessionError};
use crate::objects::SubscriptionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// Outcome of one reconnect cycle.
#[derive(Debug, Clone)]
pub struct ReconnectReport {
    pub attempts: usize,
    pub elapsed: Duration,
    pub error: Option<SessionError>,
}

/// What a reconnect cycle needs from the session it restores.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Ids subscribed before the connection dropped.
    fn subscriptions(&self) -> SubscriptionSnapshot;

    /// Forget every handle of the dead connection.
    fn discard_handles(&self);

    /// Dial again, attaching to the existing engine session.
    async fn redial(&self) -> Result<()>;

    fn restart_listener(&self);

    /// Open the previous document again and make it current.
    async fn reopen_document(&self) -> Result<()>;

    async fn refetch_sheet(&self, id: &str) -> Result<()>;

    async fn resubscribe_object(&self, id: &str) -> Result<()>;
}

pub struct ReconnectSupervisor {
    enabled: bool,
    backoff: Vec<Duration>,
    state: Mutex<ReconnectState>,
    exclusive: tokio::sync::Mutex<()>,
    in_flight: Barrier,
    last_report: Mutex<Option<ReconnectReport>>,
}

impl ReconnectSupervisor {
    pub fn new(enabled: bool, backoff: Vec<Duration>) -> Self {
        Self {
            enabled,
            backoff,
            state: Mutex::new(ReconnectState::Connected),
            exclusive: tokio::sync::Mutex::new(()),
            in_flight: Barrier::new("reconnect"),
            last_report: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> ReconnectState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ReconnectState) {
        *self.state.lock() = state;
    }

    pub fn last_report(&self) -> Option<ReconnectReport> {
        self.last_report.lock().clone()
    }

    /// Record an unexpected close and claim the cycle that answers it.
    ///
    /// The returned guard marks the cycle as in flight until the caller's
    /// task drops it. `None` when cancelled, disabled, or when a cycle is
    /// already in flight, so a burst of closes starts one cycle.
    pub fn claim_cycle(&self, cancel: &CancellationToken) -> Option<BarrierGuard> {
        if cancel.is_cancelled() {
            return None;
        }
        let mut state = self.state.lock();
        if self.in_flight.count() > 0 || *state == ReconnectState::Reconnecting {
            return None;
        }
        *state = ReconnectState::Disconnected;
        if !self.enabled {
            return None;
        }
        Some(self.in_flight.enter())
    }

    /// Wait for an in-flight reconnect, if any, without starting one.
    pub async fn wait_for_reconnect(&self, cancel: &CancellationToken) -> Result<()> {
        self.in_flight.wait_until_zero(cancel).await
    }

    /// Run one reconnect cycle against `target`.
    pub async fn reconnect<T>(&self, target: &T, cancel: &CancellationToken) -> Result<ReconnectReport>
    where
        T: ReplayTarget + ?Sized,
    {
        if !self.enabled {
            return Err(SessionError::Reconnect(Box::new(SessionError::Config(
                "reconnect is disabled".into(),
            ))));
        }

        let _gate = self.in_flight.enter();
        let _exclusive = self.exclusive.lock().await;
        self.set_state(ReconnectState::Reconnecting);

        let started = Instant::now();
        let mut attempts = 0;
        let mut last_error: Option<SessionError> = None;

        let snapshot = target.subscriptions();
        target.discard_handles();

        for delay in &self.backoff {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        last_error = Some(SessionError::Cancelled);
                        break;
                    }
                    _ = tokio::time::sleep(*delay) => {}
                }
            }
            if cancel.is_cancelled() {
                last_error = Some(SessionError::Cancelled);
                break;
            }

            attempts += 1;
            info!(attempt = attempts, "Redialing engine");
            match target.redial().await {
                Ok(()) => {}
                Err(e) if e.root().is_no_session() => {
                    warn!(attempt = attempts, "No session to attach to");
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Redial failed");
                    last_error = Some(e);
                    continue;
                }
            }

            last_error = self.replay(target, &snapshot).await.err();
            break;
        }

        if attempts == 0 && last_error.is_none() {
            last_error = Some(SessionError::Internal("empty backoff schedule".into()));
        }

        let report = ReconnectReport {
            attempts,
            elapsed: started.elapsed(),
            error: last_error.clone(),
        };
        *self.last_report.lock() = Some(report.clone());

        match last_error {
            None => {
                self.set_state(ReconnectState::Connected);
                info!(
                    attempts,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Reconnected"
                );
                Ok(report)
            }
            Some(e) => {
                self.set_state(ReconnectState::Failed);
                error!(
                    attempts,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    error = %e,
                    "Reconnect failed"
                );
                Err(SessionError::Reconnect(Box::new(e)))
            }
        }
    }

    async fn replay<T>(&self, target: &T, snapshot: &SubscriptionSnapshot) -> Result<()>
    where
        T: ReplayTarget + ?Sized,
    {
        target.restart_listener();
        target
            .reopen_document()
            .await
            .map_err(|e| e.context("reopen document"))?;

        let mut recorded = None;
        for id in &snapshot.sheets {
            if let Err(e) = target.refetch_sheet(id).await {
                warn!(sheet = %id, error = %e, "Sheet refetch failed");
                recorded = Some(e.context(format!("refetch sheet {}", id)));
            }
        }

        // Joined in place: the futures borrow `target`, and the cycle's own
        // gate keeps waiters parked until every one has settled.
        let results = futures_util::future::join_all(
            snapshot
                .objects
                .iter()
                .map(|id| async move { (id, target.resubscribe_object(id).await) }),
        )
        .await;
        for (id, result) in results {
            if let Err(e) = result {
                warn!(object = %id, error = %e, "Object resubscribe failed");
                recorded = Some(e.context(format!("resubscribe object {}", id)));
            }
        }

        match recorded {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures: usize,
        no_session: bool,
        reopen_fails: bool,
        failing_object: Option<&'static str>,
        dials: AtomicUsize,
        refetched: AtomicUsize,
        resubscribed: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                no_session: false,
                reopen_fails: false,
                failing_object: None,
                dials: AtomicUsize::new(0),
                refetched: AtomicUsize::new(0),
                resubscribed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReplayTarget for Flaky {
        fn subscriptions(&self) -> SubscriptionSnapshot {
            SubscriptionSnapshot {
                sheets: vec!["sheet".into()],
                objects: vec!["a".into(), "b".into()],
            }
        }

        fn discard_handles(&self) {}

        async fn redial(&self) -> Result<()> {
            let dial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            if self.no_session {
                return Err(SessionError::NoSessionToAttach);
            }
            if dial <= self.failures {
                return Err(SessionError::Transport("refused".into()));
            }
            Ok(())
        }

        fn restart_listener(&self) {}

        async fn reopen_document(&self) -> Result<()> {
            if self.reopen_fails {
                return Err(SessionError::Protocol("document gone".into()));
            }
            Ok(())
        }

        async fn refetch_sheet(&self, _id: &str) -> Result<()> {
            self.refetched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resubscribe_object(&self, id: &str) -> Result<()> {
            self.resubscribed.fetch_add(1, Ordering::SeqCst);
            if self.failing_object == Some(id) {
                return Err(SessionError::Remote {
                    code: 2,
                    message: format!("object {} not found", id),
                    parameter: None,
                });
            }
            Ok(())
        }
    }

    fn schedule(len: usize) -> Vec<Duration> {
        vec![Duration::from_millis(1); len]
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let supervisor = ReconnectSupervisor::new(true, schedule(6));
        let target = Flaky::new(2);

        let report = supervisor
            .reconnect(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert!(report.error.is_none());
        assert_eq!(target.resubscribed.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.state(), ReconnectState::Connected);
    }

    #[tokio::test]
    async fn test_no_session_is_terminal() {
        let supervisor = ReconnectSupervisor::new(true, schedule(6));
        let target = Flaky {
            no_session: true,
            ..Flaky::new(0)
        };

        let err = supervisor
            .reconnect(&target, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.root().is_no_session());
        assert_eq!(target.dials.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.last_report().unwrap().attempts, 1);
        assert_eq!(supervisor.state(), ReconnectState::Failed);
    }

    #[tokio::test]
    async fn test_exhausted_schedule_surfaces_last_error() {
        let supervisor = ReconnectSupervisor::new(true, schedule(3));
        let target = Flaky::new(10);

        let err = supervisor
            .reconnect(&target, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Reconnect error"));
        assert!(matches!(err.root(), SessionError::Transport(_)));
        assert_eq!(target.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_cycle() {
        let supervisor = ReconnectSupervisor::new(true, vec![Duration::from_secs(60)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = Flaky::new(0);

        let err = supervisor.reconnect(&target, &cancel).await.unwrap_err();
        assert!(err.root().is_cancelled());
        assert_eq!(target.dials.load(Ordering::SeqCst), 0);
        assert!(supervisor.claim_cycle(&cancel).is_none());
    }

    #[tokio::test]
    async fn test_reopen_failure_stops_replay() {
        let supervisor = ReconnectSupervisor::new(true, schedule(6));
        let target = Flaky {
            reopen_fails: true,
            ..Flaky::new(0)
        };

        let err = supervisor
            .reconnect(&target, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Reconnect error"));
        assert!(matches!(err.root(), SessionError::Protocol(_)));
        assert_eq!(target.dials.load(Ordering::SeqCst), 1);
        assert_eq!(target.refetched.load(Ordering::SeqCst), 0);
        assert_eq!(target.resubscribed.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.last_report().unwrap().attempts, 1);
        assert_eq!(supervisor.state(), ReconnectState::Failed);
    }

    #[tokio::test]
    async fn test_failed_object_still_replays_the_rest() {
        let supervisor = ReconnectSupervisor::new(true, schedule(6));
        let target = Flaky {
            failing_object: Some("a"),
            ..Flaky::new(0)
        };

        let err = supervisor
            .reconnect(&target, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Reconnect error"));
        assert_eq!(err.root().code(), Some(2));
        assert_eq!(target.refetched.load(Ordering::SeqCst), 1);
        assert_eq!(target.resubscribed.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.last_report().unwrap().attempts, 1);
        assert_eq!(supervisor.state(), ReconnectState::Failed);
    }

    #[test]
    fn test_claim_cycle_once_per_burst() {
        let supervisor = ReconnectSupervisor::new(true, schedule(1));
        let cancel = CancellationToken::new();

        let first = supervisor.claim_cycle(&cancel);
        assert!(first.is_some());
        assert!(supervisor.claim_cycle(&cancel).is_none());
        assert_eq!(supervisor.state(), ReconnectState::Disconnected);

        drop(first);
        assert!(supervisor.claim_cycle(&cancel).is_some());

        let disabled = ReconnectSupervisor::new(false, schedule(1));
        assert!(disabled.claim_cycle(&cancel).is_none());
        assert_eq!(disabled.state(), ReconnectState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_for_reconnect_idle() {
        let supervisor = ReconnectSupervisor::new(false, schedule(1));
        supervisor
            .wait_for_reconnect(&CancellationToken::new())
            .await
            .unwrap();
        assert!(supervisor
            .reconnect(&Flaky::new(0), &CancellationToken::new())
            .await
            .is_err());
    }
}
