//! Engine Transport
//!
//! Single responsibility: carry envelopes to the engine and surface what the
//! engine pushes back. No knowledge of retries, handles or reconnection
//! policy; a transport can fail and can be redialed, nothing more.
//!
//! [`WsTransport`] is the WebSocket implementation. Tests and tooling can
//! provide any other [`Transport`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SessionError};
use crate::rpc::{
    ChangeList, Incoming, PushEvent, RpcRequest, RpcResponse, SessionState, TOPIC_AUTHENTICATION,
    TOPIC_CONNECTED,
};

/// Everything a transport reports outside of call responses.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Server notification on a topic.
    Push(PushEvent),
    /// Change list pushed without a request.
    Changes(ChangeList),
    /// The connection ended without being asked to.
    Closed { reason: Option<String> },
}

/// Opaque, redialable channel to the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial the engine. `reconnect` asks to attach to the existing session.
    async fn connect(&self, url: &str, headers: &[(String, String)], reconnect: bool) -> Result<()>;

    /// Close the connection intentionally. No `Closed` event is emitted.
    async fn disconnect(&self);

    /// Send one request and wait for its response.
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse>;

    /// Subscribe to pushed events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Type alias for the WebSocket send half
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type PendingMap = DashMap<u64, oneshot::Sender<RpcResponse>>;

const EVENT_CAPACITY: usize = 1024;

/// WebSocket transport speaking the engine's JSON-RPC envelope.
pub struct WsTransport {
    events: broadcast::Sender<TransportEvent>,
    link: RwLock<Option<Arc<Link>>>,
    next_id: AtomicU64,
    connect_timeout: Duration,
}

/// One dialed connection. Replaced wholesale on redial.
struct Link {
    sink: Mutex<WsSink>,
    pending: Arc<PendingMap>,
    closing: Arc<AtomicBool>,
    recv_task: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.recv_task.abort();
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            link: RwLock::new(None),
            next_id: AtomicU64::new(1),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Limit how long a dial waits for the engine to report the session state.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn current_link(&self) -> Result<Arc<Link>> {
        self.link
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str, headers: &[(String, String)], reconnect: bool) -> Result<()> {
        debug!(url = %url, reconnect, "Dialing engine");

        self.disconnect().await;

        // Subscribe before dialing so the session state push cannot be missed
        let mut events = self.events.subscribe();

        let request = build_request(url, headers)?;
        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| SessionError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();
        let pending = Arc::new(PendingMap::new());
        let closing = Arc::new(AtomicBool::new(false));
        let recv_task = tokio::spawn(receiver_loop(
            stream,
            Arc::clone(&pending),
            self.events.clone(),
            Arc::clone(&closing),
        ));

        *self.link.write().await = Some(Arc::new(Link {
            sink: Mutex::new(sink),
            pending,
            closing,
            recv_task,
        }));

        let state = match tokio::time::timeout(self.connect_timeout, await_session_state(&mut events)).await {
            Ok(state) => state,
            Err(_) => Err(SessionError::Transport(
                "No session state received from engine".into(),
            )),
        };

        let outcome = match state {
            Ok(SessionState::Attached) => Ok(()),
            Ok(SessionState::Created) if reconnect => Err(SessionError::NoSessionToAttach),
            Ok(SessionState::Created) => Ok(()),
            Ok(SessionState::Other(state)) => Err(SessionError::Transport(format!(
                "Engine rejected session: {}",
                state
            ))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(url = %url, reconnect, "Engine connected");
                Ok(())
            }
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        let link = self.link.write().await.take();
        if let Some(link) = link {
            link.closing.store(true, Ordering::SeqCst);
            let _ = link.sink.lock().await.close().await;
            link.recv_task.abort();
            debug!("Engine link closed");
        }
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        let link = self.current_link().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = request.with_id(id);
        let text = serde_json::to_string(&request)?;

        let (response_tx, response_rx) = oneshot::channel();
        link.pending.insert(id, response_tx);
        let _entry = PendingEntry {
            pending: &link.pending,
            id,
        };

        link.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| SessionError::Transport(format!("Failed to send: {}", e)))?;

        response_rx
            .await
            .map_err(|_| SessionError::Transport("Connection closed before response".into()))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Removes a pending slot when the caller stops waiting (timeout, cancel).
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Wait for the engine's verdict on the dialed session.
async fn await_session_state(
    events: &mut broadcast::Receiver<TransportEvent>,
) -> Result<SessionState> {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Push(event)) if event.topic == TOPIC_CONNECTED => {
                return Ok(SessionState::from_payload(&event.payload));
            }
            Ok(TransportEvent::Push(event)) if event.topic == TOPIC_AUTHENTICATION => {
                let must_authenticate = event
                    .payload
                    .get("mustAuthenticate")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if must_authenticate {
                    let login = event
                        .payload
                        .get("loginUri")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    return Err(SessionError::AuthenticationRequired(login));
                }
            }
            Ok(TransportEvent::Closed { reason }) => {
                return Err(SessionError::Transport(format!(
                    "Connection closed during handshake: {}",
                    reason.unwrap_or_default()
                )));
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(SessionError::Transport("Event channel closed".into()));
            }
        }
    }
}

/// Receiver loop - runs in a spawned task.
///
/// Routes responses to their pending caller and everything else onto the
/// event channel. Emits `Closed` unless the link was closed on purpose.
async fn receiver_loop(
    mut stream: WsStream,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<TransportEvent>,
    closing: Arc<AtomicBool>,
) {
    debug!("Receiver loop started");
    let mut reason = None;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => route_frame(&text, &pending, &events),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => route_frame(&text, &pending, &events),
                Err(_) => warn!("Dropping non UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "Engine closed connection");
                reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Ok(_) => continue, // Ping/pong handled by tungstenite
            Err(e) => {
                error!(error = %e, "WebSocket error");
                reason = Some(e.to_string());
                break;
            }
        }
    }

    debug!("Receiver loop ended");

    // Dropping the senders fails every caller still waiting
    pending.clear();

    if !closing.load(Ordering::SeqCst) {
        let _ = events.send(TransportEvent::Closed { reason });
    }
}

fn route_frame(text: &str, pending: &PendingMap, events: &broadcast::Sender<TransportEvent>) {
    match Incoming::parse(text) {
        Ok(Incoming::Response(response)) => {
            let Some(id) = response.id else { return };
            match pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(response);
                }
                None => debug!(id, "Response for request nobody is waiting on"),
            }
        }
        Ok(Incoming::Push(event)) => {
            let _ = events.send(TransportEvent::Push(event));
        }
        Ok(Incoming::Changes(changes)) => {
            let _ = events.send(TransportEvent::Changes(changes));
        }
        Err(e) => warn!(error = %e, "Failed to decode frame"),
    }
}

fn build_request(url: &str, headers: &[(String, String)]) -> Result<Request<()>> {
    let mut builder = Request::builder()
        .uri(url)
        .header("Host", extract_host(url))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        );

    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(())
        .map_err(|e| SessionError::Transport(format!("Failed to build request: {}", e)))
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
