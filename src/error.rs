//! Error types for simuser-session

use std::time::Duration;
use thiserror::Error;

use crate::rpc::Handle;

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Engine error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        parameter: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No session to attach to")]
    NoSessionToAttach,

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Reconnect error: {0}")]
    Reconnect(Box<SessionError>),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SessionError>,
    },

    #[error("Handle {0} is already registered")]
    AlreadyRegistered(Handle),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Wrap this error with a description of what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        SessionError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with context and reconnect wrappers removed.
    pub fn root(&self) -> &SessionError {
        match self {
            SessionError::Context { source, .. } => source.root(),
            SessionError::Reconnect(inner) => inner.root(),
            other => other,
        }
    }

    /// Engine error code, if the root cause is a remote error.
    pub fn code(&self) -> Option<i32> {
        match self.root() {
            SessionError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), SessionError::Cancelled)
    }

    pub fn is_no_session(&self) -> bool {
        matches!(self.root(), SessionError::NoSessionToAttach)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
