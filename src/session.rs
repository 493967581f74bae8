//! Session
//!
//! One simulated user's connection to the engine. Owns the transport, the
//! request executor, the reconnect supervisor and the push listener, and
//! wires them together:
//!
//! ```text
//! transport events ──► listener ──┬── Changes ──► registry dispatch
//!                                 ├── Push    ──► auth check
//!                                 └── Closed  ──► reconnect supervisor
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::action::ActionReport;
use crate::config::SessionConfig;
use crate::connection::EngineConnection;
use crate::error::{Result, SessionError};
use crate::objects::{
    DefinitionOutcome, EngineObject, ObjectDefinitions, ObjectKind, SubscriptionSnapshot,
};
use crate::reconnect::{ReconnectState, ReconnectSupervisor, ReplayTarget};
use crate::registry::{CallbackContext, ChangeCallback, Registration};
use crate::request::RequestExecutor;
use crate::rpc::{
    ChangeList, Handle, PushEvent, CALC_EVAL_CONDITION_FAILED, GLOBAL_HANDLE, TOPIC_AUTHENTICATION,
    TOPIC_CONNECTED,
};
use crate::transport::{Transport, TransportEvent};

pub struct Session {
    id: Uuid,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    executor: RequestExecutor,
    supervisor: ReconnectSupervisor,
    definitions: Arc<dyn ObjectDefinitions>,
    listener: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Session>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        definitions: Arc<dyn ObjectDefinitions>,
    ) -> Arc<Self> {
        let executor = RequestExecutor::new(config.request_timeout(), config.max_concurrent_tasks);
        let supervisor =
            ReconnectSupervisor::new(config.reconnect.enabled, config.reconnect.backoff_schedule());

        Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            config,
            transport,
            executor,
            supervisor,
            definitions,
            listener: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    /// Dial the engine for a new session.
    pub async fn connect(&self) -> Result<()> {
        let url = self.config.connect_url()?;
        self.restart_listener();
        self.dial(&url, false).await?;
        self.executor
            .set_connection(Some(Arc::new(EngineConnection::new(Arc::clone(&self.transport)))));
        self.supervisor.set_state(ReconnectState::Connected);
        info!(session = %self.id, url = %url, "Session connected");
        Ok(())
    }

    /// Open the configured app and make it the current document.
    pub async fn open_app(&self) -> Result<Handle> {
        let result = self
            .executor
            .call(GLOBAL_HANDLE, "OpenDoc", json!([self.config.app]))
            .await?;
        let handle = returned_handle(&result)?;
        self.executor
            .objects()
            .insert(EngineObject::new(handle, self.config.app.clone(), ObjectKind::Document));
        debug!(session = %self.id, handle, app = %self.config.app, "App opened");
        Ok(handle)
    }

    /// Open objects by id and keep them in sync.
    ///
    /// Sheets fetch their layout before this returns. Generic objects sync
    /// in the background, counted on the object-sync barrier.
    pub async fn subscribe_objects(&self, kind: ObjectKind, ids: &[String]) -> Result<Vec<Handle>> {
        if kind == ObjectKind::Document {
            return Err(SessionError::Config(
                "documents are opened with open_app".into(),
            ));
        }
        let document = self
            .executor
            .objects()
            .document()
            .ok_or_else(|| SessionError::Protocol("no document open".into()))?;

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self
                .executor
                .call(document.handle, "GetObject", json!([id]))
                .await?;
            let handle = returned_handle(&result)?;
            self.executor
                .objects()
                .insert(EngineObject::new(handle, id.clone(), kind));

            let objects = Arc::clone(self.executor.objects());
            let sync = Arc::new(ObjectSync {
                definitions: Arc::clone(&self.definitions),
            });
            self.executor.registry().register(
                Registration::new(handle, sync)
                    .counted_on(self.executor.barriers().objects.clone())
                    .on_deregister(move |handle| {
                        objects.remove(handle);
                    }),
            );

            match kind {
                ObjectKind::Sheet => {
                    let layout = self.executor.call(handle, "GetLayout", json!([])).await?;
                    self.executor.objects().set_layout(handle, layout);
                }
                _ => self.executor.dispatch(ChangeList::new([handle], [])),
            }
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Stop syncing the given handles and release their cached state.
    pub fn unsubscribe_objects(&self, handles: &[Handle]) {
        self.executor.registry().deregister_many(handles);
        for &handle in handles {
            self.executor.objects().remove(handle);
        }
    }

    /// Wait for any reconnect in flight, then for every queued request and
    /// callback to finish.
    pub async fn wait_for_quiescence(&self) -> Result<()> {
        let cancel = self.executor.base_token();
        self.supervisor.wait_for_reconnect(&cancel).await?;
        self.executor.wait_for_requests().await
    }

    pub async fn wait_for_object_sync(&self) -> Result<()> {
        self.executor.wait_for_object_sync().await
    }

    pub async fn wait_for_rest(&self) -> Result<()> {
        self.executor.wait_for_rest().await
    }

    pub fn begin_action(&self, name: impl Into<String>) {
        self.executor.action().begin(name);
    }

    /// Settle outstanding work and take the action's report.
    pub async fn finish_action(&self) -> ActionReport {
        if let Err(e) = self.wait_for_quiescence().await {
            if !self.executor.is_cancelled() {
                self.executor.action().fail(e);
            }
        }
        self.executor.action().finish()
    }

    /// Cancel every request in flight and every wait.
    pub fn cancel(&self) {
        debug!(session = %self.id, "Session cancelled");
        self.executor.cancel();
    }

    pub async fn disconnect(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.transport.disconnect().await;
        self.executor.set_connection(None);
        self.supervisor.set_state(ReconnectState::Disconnected);
    }

    /// Return to a clean state between iterations.
    pub async fn reset(&self) {
        if let Err(e) = self.wait_for_quiescence().await {
            debug!(session = %self.id, error = %e, "Reset without full drain");
        }
        self.disconnect().await;
        self.executor.registry().clear();
        self.executor.objects().clear();
        self.executor.action().finish();
        self.executor.renew_base_token();
    }

    /// Dial through the transport, giving up as soon as the session is
    /// cancelled.
    async fn dial(&self, url: &str, reconnect: bool) -> Result<()> {
        let cancel = self.executor.base_token();
        let headers = self.config.header_pairs();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.transport.connect(url, &headers, reconnect) => result,
        }
    }

    fn spawn_listener(&self) -> JoinHandle<()> {
        let mut events = self.transport.events();
        let this = self.this.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = this.upgrade() else {
                    break;
                };
                session.handle_event(event);
            }
        })
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Changes(changes) => self.executor.dispatch(changes),
            TransportEvent::Push(push) => self.handle_push(push),
            TransportEvent::Closed { reason } => self.handle_closed(reason),
        }
    }

    fn handle_push(&self, push: PushEvent) {
        match push.topic.as_str() {
            TOPIC_AUTHENTICATION => {
                let must_authenticate = push
                    .payload
                    .get("mustAuthenticate")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if must_authenticate {
                    let login = push
                        .payload
                        .get("loginUri")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.executor
                        .action()
                        .fail(SessionError::AuthenticationRequired(login));
                }
            }
            TOPIC_CONNECTED => trace!(payload = %push.payload, "Session state"),
            other => trace!(topic = other, "Unhandled push"),
        }
    }

    fn handle_closed(&self, reason: Option<String>) {
        let cancel = self.executor.base_token();
        if cancel.is_cancelled() {
            debug!(session = %self.id, "Connection closed after cancel");
            return;
        }
        if !self.supervisor.enabled() {
            self.supervisor.set_state(ReconnectState::Disconnected);
            self.executor.action().fail(SessionError::Transport(format!(
                "connection lost: {}",
                reason.unwrap_or_else(|| "closed".into())
            )));
            return;
        }
        let Some(gate) = self.supervisor.claim_cycle(&cancel) else {
            debug!(session = %self.id, reason = ?reason, "Reconnect already in flight");
            return;
        };
        let Some(session) = self.this.upgrade() else {
            return;
        };

        warn!(session = %self.id, reason = ?reason, "Connection lost, reconnecting");
        tokio::spawn(async move {
            let cancel = session.executor.base_token();
            if let Err(e) = session.supervisor.reconnect(session.as_ref(), &cancel).await {
                if !session.executor.is_cancelled() {
                    session.executor.action().fail(e);
                }
            }
            drop(gate);
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl ReplayTarget for Session {
    fn subscriptions(&self) -> SubscriptionSnapshot {
        self.executor.objects().snapshot()
    }

    fn discard_handles(&self) {
        self.executor.registry().clear();
        self.executor.objects().clear();
    }

    async fn redial(&self) -> Result<()> {
        let url = self.config.connect_url()?;
        self.dial(&url, true).await
    }

    fn restart_listener(&self) {
        let listener = self.spawn_listener();
        if let Some(old) = self.listener.lock().replace(listener) {
            old.abort();
        }
    }

    async fn reopen_document(&self) -> Result<()> {
        self.open_app().await.map(|_| ())
    }

    async fn refetch_sheet(&self, id: &str) -> Result<()> {
        self.subscribe_objects(ObjectKind::Sheet, &[id.to_string()])
            .await
            .map(|_| ())
    }

    async fn resubscribe_object(&self, id: &str) -> Result<()> {
        self.subscribe_objects(ObjectKind::GenericObject, &[id.to_string()])
            .await
            .map(|_| ())
    }
}

fn returned_handle(result: &Value) -> Result<Handle> {
    result
        .pointer("/qReturn/qHandle")
        .and_then(Value::as_i64)
        .and_then(|handle| Handle::try_from(handle).ok())
        .ok_or_else(|| SessionError::Protocol(format!("no handle in {}", result)))
}

/// Keeps one subscribed object's layout and data current.
struct ObjectSync {
    definitions: Arc<dyn ObjectDefinitions>,
}

#[async_trait]
impl ChangeCallback for ObjectSync {
    async fn on_change(&self, cx: CallbackContext) -> Result<()> {
        let CallbackContext {
            handle,
            request,
            executor,
        } = cx;
        let connection = executor.connection()?;

        let layout = connection
            .call(&request, handle, "GetLayout", json!([]))
            .await?;
        executor.dispatch(request.changes().take());

        // Closed while the layout was in flight
        if !executor.objects().set_layout(handle, layout) {
            return Ok(());
        }
        let Some(object) = executor.objects().get(handle) else {
            return Ok(());
        };

        match self.definitions.data_requests(&object) {
            DefinitionOutcome::NoDefinition => {
                debug!(handle, id = %object.id, "No definition, layout only");
            }
            DefinitionOutcome::NoDataCarrier => {}
            DefinitionOutcome::Requests(requests) => {
                for data_request in requests {
                    let guard = executor.barriers().objects.enter();
                    let objects = Arc::clone(executor.objects());
                    let connection = Arc::clone(&connection);
                    executor.queue_request(true, move |ctx| async move {
                        let _guard = guard;
                        let method = data_request.method;
                        match connection
                            .call(&ctx, handle, &method, data_request.params)
                            .await
                        {
                            Ok(data) => {
                                objects.set_data(handle, &method, data);
                                Ok(())
                            }
                            Err(e) if e.code() == Some(CALC_EVAL_CONDITION_FAILED) => {
                                debug!(handle, method = %method, "Calculation condition not met");
                                Ok(())
                            }
                            Err(e) => Err(e),
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returned_handle() {
        assert_eq!(returned_handle(&json!({"qReturn": {"qHandle": 5}})).unwrap(), 5);
        assert!(matches!(
            returned_handle(&json!({"qReturn": {"qHandle": 1i64 << 40}})),
            Err(SessionError::Protocol(_))
        ));
        assert!(returned_handle(&json!({"qReturn": {}})).is_err());
    }
}
