//! Simulated user configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{Result, SessionError};

/// Applied when the configured schedule is empty.
pub const DEFAULT_BACKOFF: [f64; 6] = [0.0, 2.0, 2.0, 2.0, 2.0, 2.0];

/// Applied when the configured request timeout is unset or below 1 ms.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Engine host, optionally with port
    pub server: String,

    /// Use wss:// instead of ws://
    #[serde(default)]
    pub secure: bool,

    /// Virtual proxy prefix in front of /app
    #[serde(default)]
    pub virtual_proxy: Option<String>,

    /// Document to open
    pub app: String,

    /// Per-call timeout in seconds
    #[serde(default)]
    pub request_timeout_secs: f64,

    /// Upper bound on concurrently running counted tasks
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Extra headers sent on every dial
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Wait before each redial, in seconds
    #[serde(default)]
    pub backoff: Vec<f64>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff: Vec::new(),
        }
    }
}

impl ReconnectSettings {
    /// Effective schedule. Negative and non-finite steps count as zero.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let steps: &[f64] = if self.backoff.is_empty() {
            &DEFAULT_BACKOFF
        } else {
            &self.backoff
        };
        steps
            .iter()
            .map(|&secs| {
                if secs.is_finite() && secs > 0.0 {
                    Duration::from_secs_f64(secs)
                } else {
                    Duration::ZERO
                }
            })
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_tasks() -> usize {
    512
}

impl SessionConfig {
    pub fn new(server: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            secure: false,
            virtual_proxy: None,
            app: app.into(),
            headers: BTreeMap::new(),
            request_timeout_secs: 0.0,
            reconnect: ReconnectSettings::default(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(SessionError::Config("server must not be empty".into()));
        }
        if self.app.trim().is_empty() {
            return Err(SessionError::Config("app must not be empty".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(SessionError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        self.connect_url().map(|_| ())
    }

    pub fn request_timeout(&self) -> Duration {
        let secs = self.request_timeout_secs;
        if !secs.is_finite() || secs < 0.001 {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// `ws(s)://server[/virtual proxy]/app/<app>`
    pub fn connect_url(&self) -> Result<String> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}", scheme, self.server))
            .map_err(|e| SessionError::Config(format!("invalid server '{}': {}", self.server, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SessionError::Config(format!("server '{}' cannot carry a path", self.server)))?;
            segments.clear();
            if let Some(proxy) = self.virtual_proxy.as_deref().filter(|p| !p.is_empty()) {
                segments.push(proxy);
            }
            segments.push("app").push(&self.app);
        }
        Ok(url.to_string())
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Concurrent simulated users
    #[serde(default = "default_users")]
    pub users: usize,

    /// Iterations per user
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Sheet ids each iteration subscribes to
    #[serde(default)]
    pub sheets: Vec<String>,

    /// Generic object ids each iteration subscribes to
    #[serde(default)]
    pub objects: Vec<String>,

    pub session: SessionConfig,
}

fn default_users() -> usize {
    1
}

fn default_iterations() -> usize {
    1
}

impl SimulationConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.as_ref().display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.users == 0 {
            return Err(SessionError::Config("users must be at least 1".into()));
        }
        self.session.validate()
    }
}
