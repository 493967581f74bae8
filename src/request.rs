//! Request executor
//!
//! The one place calls enter the session. Synchronous calls dispatch the
//! changes they produced once they succeed; queued calls run as counted
//! tasks and route their errors to the current action.

use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::ActionState;
use crate::barrier::{catch_panic, Barrier, Barriers};
use crate::connection::EngineConnection;
use crate::context::{CallOptions, RequestContext};
use crate::error::{Result, SessionError};
use crate::objects::ObjectRegistry;
use crate::registry::EventRegistry;
use crate::rpc::{ChangeList, Handle};

/// Shared handle to the session's call machinery. Cheap to clone.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    base: RwLock<CancellationToken>,
    request_timeout: Duration,
    connection: RwLock<Option<Arc<EngineConnection>>>,
    registry: Arc<EventRegistry>,
    objects: Arc<ObjectRegistry>,
    barriers: Barriers,
    action: Arc<ActionState>,
    limiter: Arc<Semaphore>,
}

impl RequestExecutor {
    pub fn new(request_timeout: Duration, max_concurrent_tasks: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                base: RwLock::new(CancellationToken::new()),
                request_timeout,
                connection: RwLock::new(None),
                registry: Arc::new(EventRegistry::new()),
                objects: Arc::new(ObjectRegistry::new()),
                barriers: Barriers::default(),
                action: Arc::new(ActionState::new()),
                limiter: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            }),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub fn base_token(&self) -> CancellationToken {
        self.inner.base.read().clone()
    }

    /// Cancel every context derived so far and every wait in progress.
    pub fn cancel(&self) {
        self.inner.base.read().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.base.read().is_cancelled()
    }

    /// Swap in a fresh base token if the current one was cancelled.
    pub fn renew_base_token(&self) {
        let mut base = self.inner.base.write();
        if base.is_cancelled() {
            *base = CancellationToken::new();
            debug!("Base cancellation token renewed");
        }
    }

    /// Fresh context derived from the base token.
    pub fn request_context(&self) -> RequestContext {
        RequestContext::derive(&self.base_token(), self.inner.request_timeout)
    }

    pub fn connection(&self) -> Result<Arc<EngineConnection>> {
        self.inner
            .connection
            .read()
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    pub fn set_connection(&self, connection: Option<Arc<EngineConnection>>) {
        *self.inner.connection.write() = connection;
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.inner.objects
    }

    pub fn barriers(&self) -> &Barriers {
        &self.inner.barriers
    }

    pub fn action(&self) -> &Arc<ActionState> {
        &self.inner.action
    }

    /// Run `call` with a fresh context and wait for it.
    ///
    /// On success the changes it accumulated are dispatched before returning.
    /// On failure they are dropped and the error goes back to the caller.
    pub async fn send_request<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = self.request_context();
        let value = call(ctx.clone()).await?;
        self.dispatch(ctx.changes().take());
        Ok(value)
    }

    /// Synchronous call of `method` on `handle`.
    pub async fn call(&self, handle: Handle, method: &str, params: Value) -> Result<Value> {
        self.call_with(CallOptions::default(), handle, method, params)
            .await
    }

    pub async fn call_with(
        &self,
        options: CallOptions,
        handle: Handle,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let connection = self.connection()?;
        self.send_request(|ctx| async move {
            connection
                .call(&ctx.with_options(options), handle, method, params)
                .await
        })
        .await
    }

    /// Fire-and-track: run `call` as a counted task on the session barrier.
    pub fn queue_request<F, Fut>(&self, fail_on_error: bool, call: F)
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.queue_request_with_callback(fail_on_error, call, |_| {});
    }

    /// Like [`queue_request`](Self::queue_request), then hand the outcome to
    /// `on_complete` after errors were routed and changes dispatched.
    pub fn queue_request_with_callback<F, Fut, C>(&self, fail_on_error: bool, call: F, on_complete: C)
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce(Result<()>) + Send + 'static,
    {
        let executor = self.clone();
        self.inner.barriers.session.spawn(
            "queued request",
            Some(Arc::clone(&self.inner.limiter)),
            async move {
                let ctx = executor.request_context();
                let call_ctx = ctx.clone();
                let result = catch_panic(async move { call(call_ctx).await }).await;
                if let Err(e) = &result {
                    executor.route_error("queued request", fail_on_error, e.clone());
                }
                executor.dispatch(ctx.changes().take());
                on_complete(result);
            },
        );
    }

    /// Dispatch a change list through the registry.
    pub fn dispatch(&self, changes: ChangeList) {
        self.inner.registry.dispatch(self, changes);
    }

    /// Spawn counted work on the session barrier.
    pub fn spawn_counted<F>(&self, label: &'static str, fail_on_error: bool, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_on(&self.inner.barriers.session, label, fail_on_error, fut)
    }

    /// Spawn counted work on the REST barrier.
    pub fn spawn_rest<F>(&self, label: &'static str, fail_on_error: bool, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_on(&self.inner.barriers.rest, label, fail_on_error, fut)
    }

    fn spawn_on<F>(
        &self,
        barrier: &Barrier,
        label: &'static str,
        fail_on_error: bool,
        fut: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let executor = self.clone();
        barrier.spawn(label, Some(Arc::clone(&self.inner.limiter)), async move {
            if let Err(e) = catch_panic(fut).await {
                executor.route_error(label, fail_on_error, e);
            }
        })
    }

    /// Send an asynchronous error where it belongs.
    ///
    /// Cancellation after the session was cancelled is expected and only
    /// logged. Otherwise the action fails or gets a warning.
    pub fn route_error(&self, label: &'static str, fail_on_error: bool, error: SessionError) {
        if error.is_cancelled() && self.is_cancelled() {
            debug!(task = label, "Task cancelled with session");
            return;
        }
        if fail_on_error {
            self.inner.action.fail(error);
        } else {
            warn!(task = label, error = %error, "Task failed");
            self.inner.action.warn(format!("{}: {}", label, error));
        }
    }

    /// Wait until every queued request and callback, including those they
    /// start, has finished.
    pub async fn wait_for_requests(&self) -> Result<()> {
        self.inner
            .barriers
            .session
            .wait_until_zero(&self.base_token())
            .await
    }

    pub async fn wait_for_object_sync(&self) -> Result<()> {
        self.inner
            .barriers
            .objects
            .wait_until_zero(&self.base_token())
            .await
    }

    pub async fn wait_for_rest(&self) -> Result<()> {
        self.inner
            .barriers
            .rest
            .wait_until_zero(&self.base_token())
            .await
    }
}
