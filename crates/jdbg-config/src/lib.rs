//! Configuration model and logging bootstrap for jdbg.
//!
//! Every section is optional in TOML; missing keys fall back to the defaults
//! documented on each field.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt, TestWriter};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JdbgConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub jdwp: JdwpConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl JdbgConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse TOML text. Unknown keys are ignored with a warning.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let (config, unknown) = Self::from_toml_str_with_unknown_keys(text)?;
        for key in unknown {
            tracing::warn!(target: "jdbg.config", %key, "ignoring unknown config key");
        }
        Ok(config)
    }

    /// Parse TOML text, also returning the dotted paths of keys that did not
    /// match any setting (for example `session.event_bufer_capacity`).
    pub fn from_toml_str_with_unknown_keys(text: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut unknown = Vec::new();
        let config = serde_ignored::deserialize(toml::de::Deserializer::new(text), |path| {
            unknown.push(path.to_string().trim_start_matches('.').to_owned());
        })?;
        unknown.sort();
        unknown.dedup();
        Ok((config, unknown))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level for all jdbg crates.
    ///
    /// Accepts a plain level (`info`, `debug`, ...) or a full `EnvFilter`
    /// directive string such as `jdbg.events=trace,info`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while stderr
    /// logging stays active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    /// Bare level names are canonicalized; anything else is passed through
    /// as `EnvFilter` directives.
    pub(crate) fn directives(&self) -> String {
        let level = self.level.trim();
        match level.to_ascii_lowercase().as_str() {
            "" => Self::default_level(),
            "warning" => "warn".to_owned(),
            known @ ("trace" | "debug" | "info" | "warn" | "error") => known.to_owned(),
            _ => level.to_owned(),
        }
    }

    /// The configured directives, extended by `RUST_LOG` when it is set.
    ///
    /// Falls back to `RUST_LOG` alone, then to the configured directives,
    /// then to `info` when a combination does not parse.
    pub fn env_filter(&self) -> EnvFilter {
        let configured = self.directives();
        let from_env = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let mut candidates = Vec::with_capacity(3);
        if let Some(from_env) = from_env {
            candidates.push(format!("{configured},{from_env}"));
            candidates.push(from_env);
        }
        candidates.push(configured);
        candidates
            .into_iter()
            .find_map(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }

    /// Where formatted log lines go: stderr, the log file, both, or nowhere.
    ///
    /// An unopenable log file is skipped; stderr keeps working.
    fn make_writer(&self) -> BoxMakeWriter {
        let file = self.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
                .map(Mutex::new)
        });

        match (self.stderr, file) {
            (true, Some(file)) => BoxMakeWriter::new(stderr_writer().and(file)),
            (true, None) => BoxMakeWriter::new(stderr_writer()),
            (false, Some(file)) => BoxMakeWriter::new(file),
            (false, None) => BoxMakeWriter::new(std::io::sink),
        }
    }
}

#[cfg(debug_assertions)]
fn stderr_writer() -> fn() -> TestWriter {
    // Captured per test by the harness.
    TestWriter::with_stderr
}

#[cfg(not(debug_assertions))]
fn stderr_writer() -> fn() -> std::io::Stderr {
    std::io::stderr
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

/// Per-session tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of buffered events per session. The oldest event is
    /// dropped when the buffer is full.
    #[serde(default = "SessionConfig::default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,

    /// How long the event processor blocks for the next event batch before
    /// checking for shutdown.
    #[serde(default = "SessionConfig::default_event_poll_interval_ms")]
    pub event_poll_interval_ms: u64,

    /// Timeout used by `waitForEvent` when the caller passes a non-positive value.
    #[serde(default = "SessionConfig::default_wait_timeout_ms")]
    pub default_wait_timeout_ms: u64,

    /// Request thread start/death events from the target.
    #[serde(default = "SessionConfig::default_track_thread_lifecycle")]
    pub track_thread_lifecycle: bool,
}

impl SessionConfig {
    fn default_event_buffer_capacity() -> usize {
        1_000
    }

    fn default_event_poll_interval_ms() -> u64 {
        1_000
    }

    fn default_wait_timeout_ms() -> u64 {
        30_000
    }

    fn default_track_thread_lifecycle() -> bool {
        true
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms.max(1))
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_buffer_capacity: Self::default_event_buffer_capacity(),
            event_poll_interval_ms: Self::default_event_poll_interval_ms(),
            default_wait_timeout_ms: Self::default_wait_timeout_ms(),
            track_thread_lifecycle: Self::default_track_thread_lifecycle(),
        }
    }
}

/// Settings for the JDWP socket transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JdwpConfig {
    #[serde(default = "JdwpConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "JdwpConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Capacity of the broadcast channel carrying decoded event sets.
    #[serde(default = "JdwpConfig::default_event_channel_size")]
    pub event_channel_size: usize,

    /// Java launcher used for launched sessions.
    #[serde(default = "JdwpConfig::default_java")]
    pub java: String,
}

impl JdwpConfig {
    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_reply_timeout_ms() -> u64 {
        10_000
    }

    fn default_event_channel_size() -> usize {
        256
    }

    fn default_java() -> String {
        "java".to_owned()
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
            event_channel_size: Self::default_event_channel_size(),
            java: Self::default_java(),
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber described by `logging`.
///
/// Only the first call has an effect. A subscriber the embedding application
/// installed earlier is left alone.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let fmt = tracing_subscriber::fmt::layer()
            .with_writer(logging.make_writer())
            .with_ansi(false);
        // `json()` changes the layer type, hence the boxing.
        let fmt: Box<dyn Layer<Registry> + Send + Sync> = if logging.json {
            Box::new(fmt.json())
        } else {
            Box::new(fmt)
        };

        let installed = tracing_subscriber::registry()
            .with(fmt)
            .with(logging.env_filter())
            .try_init();
        if let Err(err) = installed {
            tracing::debug!(target: "jdbg.config", error = %err, "keeping existing global subscriber");
        }
    });
}
