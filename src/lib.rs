//! Simuser Session - session synchronization and recovery for simulated users
//!
//! Drives one simulated user's conversation with an analytics engine over a
//! JSON-RPC WebSocket: calls, the change notifications they trigger, and
//! recovery when the connection drops.
//!
//! ## Architecture
//!
//! | Module | Role |
//! |--------|------|
//! | `barrier` | Counts outstanding tasks per scope, waits for zero |
//! | `retry` | Retries "generic aborted" responses a bounded number of times |
//! | `registry` | Maps handles to change callbacks, dispatches change lists |
//! | `request` | Runs calls with fresh contexts, routes async errors |
//! | `reconnect` | Redials on a backoff schedule and replays subscriptions |
//! | `session` | Wires transport, executor and supervisor together |
//!
//! ## Data Flow
//!
//! ```text
//! caller ──► RequestExecutor ──► EngineConnection ──► Transport
//!                 ▲                                      │
//!                 │                     response + change list
//!                 │                                      ▼
//!            callbacks ◄──────────── EventRegistry::dispatch
//! ```
//!
//! Every dispatched callback re-enters the executor, so one caller turn may
//! fan out into a cascade. The session barrier counts all of it.

pub mod action;
pub mod barrier;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod objects;
pub mod reconnect;
pub mod registry;
pub mod request;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod transport;

pub use action::{ActionReport, ActionState};
pub use barrier::{Barrier, BarrierGuard, Barriers};
pub use config::{ReconnectSettings, SessionConfig, SimulationConfig};
pub use connection::EngineConnection;
pub use context::{CallOptions, RequestContext};
pub use error::{Result, SessionError};
pub use objects::{
    DataRequest, DefinitionOutcome, EngineObject, NoDefinitions, ObjectDefinitions, ObjectKind,
    ObjectRegistry,
};
pub use reconnect::{ReconnectReport, ReconnectState, ReconnectSupervisor, ReplayTarget};
pub use registry::{CallbackContext, ChangeCallback, EventRegistry, Registration};
pub use request::RequestExecutor;
pub use retry::RetryInterceptor;
pub use rpc::{ChangeList, Handle, RpcRequest, RpcResponse};
pub use session::Session;
pub use transport::{Transport, TransportEvent, WsTransport};
