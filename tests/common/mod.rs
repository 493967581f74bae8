//! Scripted in-memory transport shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use simuser_session::rpc::PushEvent;
use simuser_session::{
    ChangeList, Handle, Result, RpcRequest, RpcResponse, SessionError, Transport, TransportEvent,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub type Responder = Arc<dyn Fn(&RpcRequest) -> Result<RpcResponse> + Send + Sync>;

pub struct ScriptedTransport {
    events: broadcast::Sender<TransportEvent>,
    responders: Mutex<HashMap<String, Responder>>,
    connect_results: Mutex<VecDeque<Result<()>>>,
    calls: Mutex<Vec<RpcRequest>>,
    connects: Mutex<Vec<bool>>,
    connect_delay: Mutex<Duration>,
    next_handle: Arc<AtomicI32>,
    next_id: AtomicU64,
}

impl ScriptedTransport {
    /// OpenDoc and GetObject hand out fresh handles, GetLayout echoes the
    /// handle, everything else answers `{}`.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let transport = Self {
            events,
            responders: Mutex::new(HashMap::new()),
            connect_results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            next_handle: Arc::new(AtomicI32::new(1)),
            next_id: AtomicU64::new(1),
        };

        for method in ["OpenDoc", "GetObject"] {
            let counter = Arc::clone(&transport.next_handle);
            transport.respond(method, move |_| {
                let handle = counter.fetch_add(1, Ordering::SeqCst);
                Ok(RpcResponse::ok(0, json!({"qReturn": {"qHandle": handle}})))
            });
        }
        transport.respond("GetLayout", |request| {
            Ok(RpcResponse::ok(
                0,
                json!({"qInfo": {"qHandle": request.handle}}),
            ))
        });
        Arc::new(transport)
    }

    pub fn respond(
        &self,
        method: &str,
        responder: impl Fn(&RpcRequest) -> Result<RpcResponse> + Send + Sync + 'static,
    ) {
        self.responders
            .lock()
            .insert(method.to_string(), Arc::new(responder));
    }

    /// Result of the next dial. Unqueued dials succeed.
    pub fn queue_connect(&self, result: Result<()>) {
        self.connect_results.lock().push_back(result);
    }

    /// Hold every following dial this long before it resolves.
    pub fn delay_connects(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn close(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Closed {
            reason: Some(reason.to_string()),
        });
    }

    pub fn push(&self, topic: &str, payload: Value) {
        let _ = self.events.send(TransportEvent::Push(PushEvent {
            topic: topic.to_string(),
            payload,
        }));
    }

    pub fn push_changes(&self, changed: &[Handle], closed: &[Handle]) {
        let _ = self.events.send(TransportEvent::Changes(ChangeList::new(
            changed.iter().copied(),
            closed.iter().copied(),
        )));
    }

    pub fn calls(&self) -> Vec<RpcRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.method == method).count()
    }

    /// `reconnect` flag of every dial, in order.
    pub fn connects(&self) -> Vec<bool> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _url: &str, _headers: &[(String, String)], reconnect: bool) -> Result<()> {
        self.connects.lock().push(reconnect);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.connect_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) {}

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = request.with_id(id);
        self.calls.lock().push(request.clone());

        let responder = self.responders.lock().get(&request.method).cloned();
        let mut response = match responder {
            Some(responder) => responder(&request)?,
            None => RpcResponse::ok(id, json!({})),
        };
        response.id = Some(id);
        Ok(response)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut`, failing the test after two seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}

pub fn transport_error(message: &str) -> SessionError {
    SessionError::Transport(message.to_string())
}
