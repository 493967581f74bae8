//! Action log
//!
//! An action is one logical step of a simulated user. Errors from
//! asynchronous work have no caller to unwind to, so they are collected here
//! and read back when the action finishes.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SessionError;

#[derive(Debug, Default)]
pub struct ActionState {
    log: Mutex<ActionReport>,
}

/// What happened during one action.
#[derive(Debug, Clone, Default)]
pub struct ActionReport {
    pub name: Option<String>,
    pub errors: Vec<SessionError>,
    pub warnings: Vec<String>,
}

impl ActionReport {
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// First recorded error, if any, as a `Result`.
    pub fn into_result(self) -> Result<ActionReport, SessionError> {
        match self.errors.first() {
            Some(error) => Err(error.clone()),
            None => Ok(self),
        }
    }
}

impl ActionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new action, discarding anything recorded for the previous one.
    pub fn begin(&self, name: impl Into<String>) {
        let name = name.into();
        debug!(action = %name, "Action started");
        *self.log.lock() = ActionReport {
            name: Some(name),
            ..Default::default()
        };
    }

    /// Fail the current action.
    pub fn fail(&self, error: SessionError) {
        let mut log = self.log.lock();
        warn!(action = ?log.name, error = %error, "Action error");
        log.errors.push(error);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        let mut log = self.log.lock();
        warn!(action = ?log.name, warning = %message, "Action warning");
        log.warnings.push(message);
    }

    pub fn failed(&self) -> bool {
        self.log.lock().failed()
    }

    pub fn errors(&self) -> Vec<SessionError> {
        self.log.lock().errors.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.log.lock().warnings.clone()
    }

    /// Take the report for the current action, leaving an empty one.
    pub fn finish(&self) -> ActionReport {
        std::mem::take(&mut *self.log.lock())
    }
}
