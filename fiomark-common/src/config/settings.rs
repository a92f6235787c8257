//! Runner settings loaded from `config.toml` and `FIOMARK_*` variables.

use super::env::{EnvError, EnvParser, expand_home};
use super::source::ConfigSource;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from loading the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings that shape how the engine drives fio.
///
/// These are operator preferences, not benchmark parameters; the profile
/// itself is supplied separately per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FiomarkConfig {
    /// Explicit fio binary. `None` searches `PATH` for `fio`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fio_path: Option<PathBuf>,
    /// Which layer set `fio_path`.
    #[serde(skip)]
    pub fio_path_source: ConfigSource,
    /// fio `--ioengine`.
    pub ioengine: String,
    /// Time a terminated fio gets to exit before it is killed.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    /// Extra time past the job duration before the watchdog fires.
    #[serde(with = "duration_str")]
    pub watchdog_slack: Duration,
    /// fio `--status-interval`; controls how often progress samples arrive.
    #[serde(with = "duration_str")]
    pub status_interval: Duration,
    /// Drop the page cache before every job (Linux, needs privileges).
    pub flush_page_cache: bool,
    /// Leave the test file in place after the run.
    pub keep_test_file: bool,
    /// Halt the battery after the first per-job failure.
    pub abort_on_job_failure: bool,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for FiomarkConfig {
    fn default() -> Self {
        Self {
            fio_path: None,
            fio_path_source: ConfigSource::Default,
            ioengine: default_ioengine().to_string(),
            grace_period: Duration::from_secs(5),
            watchdog_slack: Duration::from_secs(60),
            status_interval: Duration::from_secs(1),
            flush_page_cache: false,
            keep_test_file: false,
            abort_on_job_failure: false,
            event_buffer: 256,
        }
    }
}

fn default_ioengine() -> &'static str {
    if cfg!(target_os = "linux") {
        "libaio"
    } else if cfg!(windows) {
        "windowsaio"
    } else {
        "posixaio"
    }
}

impl FiomarkConfig {
    /// Default location: `<config_dir>/fiomark/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fiomark").join("config.toml"))
    }

    /// Load settings from `path`, or from the default location if it exists.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        if config.fio_path.is_some() {
            config.fio_path_source = ConfigSource::File;
        }
        Ok(config)
    }

    /// Point at an fio binary named on the command line.
    pub fn override_fio_path(&mut self, path: PathBuf) {
        self.fio_path = Some(path);
        self.fio_path_source = ConfigSource::CommandLine;
    }

    /// Apply `FIOMARK_*` overrides, returning every invalid variable.
    pub fn apply_env(&mut self) -> Vec<EnvError> {
        let mut parser = EnvParser::new();

        let fio = parser.get_optional_string("FIO");
        if fio.is_from_env()
            && let Some(path) = fio.into_inner()
        {
            self.fio_path = Some(expand_home(&path));
            self.fio_path_source = ConfigSource::Environment;
        }

        let ioengine = parser.get_string("IOENGINE", &self.ioengine);
        self.ioengine = ioengine.into_inner();
        self.grace_period = parser.get_duration("GRACE_PERIOD", self.grace_period).value;
        self.watchdog_slack = parser
            .get_duration("WATCHDOG_SLACK", self.watchdog_slack)
            .value;
        self.status_interval = parser
            .get_duration("STATUS_INTERVAL", self.status_interval)
            .value;
        self.flush_page_cache = parser
            .get_bool("FLUSH_PAGE_CACHE", self.flush_page_cache)
            .value;
        self.keep_test_file = parser.get_bool("KEEP_TEST_FILE", self.keep_test_file).value;
        self.abort_on_job_failure = parser
            .get_bool("ABORT_ON_JOB_FAILURE", self.abort_on_job_failure)
            .value;
        self.event_buffer = parser
            .get_u64_range("EVENT_BUFFER", self.event_buffer as u64, 1, 65_536)
            .value as usize;

        parser.take_errors()
    }
}

mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
