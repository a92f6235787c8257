//! Logging setup shared by the fiomark binaries.
//!
//! `LogConfig` is built from the environment and then adjusted by CLI
//! flags; `init_logging` installs the global subscriber and returns the
//! appender guards that must stay alive for the life of the process.

use std::path::PathBuf;

use crate::config::{EnvError, EnvParser, expand_home};
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Where and how log output is written.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `fiomark=debug,warn`.
    pub level: String,
    /// Emit human-readable output on stderr.
    pub stderr: bool,
    /// Emit JSON instead of the compact text format.
    pub json: bool,
    /// Optional log file (appended, written by a background worker).
    pub file: Option<PathBuf>,
    /// Rejected `FIOMARK_LOG_*` values, logged after setup.
    pub env_errors: Vec<EnvError>,
}

impl LogConfig {
    /// Start from `default_level`, honoring `FIOMARK_LOG` then `RUST_LOG`.
    ///
    /// Invalid `FIOMARK_LOG_*` values fall back to defaults and are reported
    /// once the subscriber is installed.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();

        let level = parser
            .get_optional_string("LOG")
            .into_inner()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| default_level.to_string());
        let json = parser.get_bool("LOG_JSON", false).into_inner();
        let file = parser
            .get_optional_string("LOG_FILE")
            .into_inner()
            .filter(|v| !v.trim().is_empty())
            .map(|v| expand_home(&v));

        Self {
            level,
            stderr: false,
            json,
            file,
            env_errors: parser.take_errors(),
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

/// Guards for background log writers. Dropping them flushes pending lines.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global tracing subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log filter '{}'", config.level))?;

    let mut guards = Vec::new();

    let stderr_layer = config.stderr.then(|| {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        if config.json {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        }
    });

    let file_layer = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(&directory)
                .with_context(|| format!("failed to create log directory {}", directory.display()))?;

            let appender = tracing_appender::rolling::never(&directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    for err in &config.env_errors {
        tracing::warn!("{err}");
    }

    Ok(LoggingGuards { _guards: guards })
}
