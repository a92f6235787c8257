//! Configuration system for fiomark.
//!
//! Settings are layered: built-in defaults, then `config.toml`, then
//! `FIOMARK_*` environment variables, then command-line flags (applied by
//! the binary). Environment parsing collects every error so all issues can
//! be reported at once.

pub mod env;
pub mod settings;
pub mod source;

pub use env::{EnvError, EnvParser, expand_home};
pub use settings::{ConfigError, FiomarkConfig};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
