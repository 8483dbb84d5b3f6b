//! Configuration for the language server process and its connection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 200;

/// Configuration for spawning a language server process.
///
/// Deserializable so embedders can keep it in their own configuration
/// files; this crate does not load configuration itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// The executable path or command name.
    pub command: PathBuf,
    /// Arguments to pass to the language server.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for the process. `None` inherits the caller's
    /// environment; `Some` replaces it entirely.
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// How long `stop` waits for a voluntary exit before killing.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Timeout applied to requests that do not set their own.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

const fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

impl ServerConfig {
    /// Creates a configuration for `command` with no arguments.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: None,
            working_dir: None,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            request_timeout_ms: None,
        }
    }

    /// Sets the command line arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable, switching from an inherited to an
    /// explicit environment.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sets a custom working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The default request timeout, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Connection options derived from this configuration.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            default_timeout: self.request_timeout(),
        }
    }
}

/// Options for a [`crate::Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Timeout applied to requests that do not set their own. `None` waits
    /// until a response, cancellation or termination.
    pub default_timeout: Option<Duration>,
}
