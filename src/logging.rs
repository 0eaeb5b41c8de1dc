//! Process-wide logger initialization.
//!
//! The logger is one of the two pieces of process-wide state in the
//! engine (the other is the default model registry) and follows the same
//! rule: explicit init, overridable by the embedding application. Nothing
//! here runs implicitly; call [`init`] once at startup, or install your
//! own `log` backend instead.

use std::str::FromStr;

/// Environment variable controlling the log level.
pub const LOG_LEVEL_ENV: &str = "ADK_LOG_LEVEL";

/// Installs the logger, honoring `ADK_LOG_LEVEL` (default `info`).
/// Calling twice, or after another backend was installed, is a no-op.
pub fn init() {
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| log::LevelFilter::from_str(&value).ok())
        .unwrap_or(log::LevelFilter::Info);
    init_with_level(level);
}

/// Installs the logger at an explicit level, ignoring the environment.
/// Calling twice, or after another backend was installed, is a no-op.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new().filter_level(level).try_init();
}
