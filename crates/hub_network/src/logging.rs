use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, fmt as layer_fmt, prelude::*, reload};

use crate::error::HubError;

/// Verbosity levels accepted by [`set_log_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn parse(name: &str) -> Result<Self, HubError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(HubError::InvalidLevel(name.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Warn,
            3 => Self::Debug,
            4 => Self::Trace,
            _ => Self::Info,
        }
    }
}

impl FromStr for LogLevel {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();
static CURRENT: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Initializes console logging with a filter that [`set_log_level`] can swap
/// at runtime. `RUST_LOG`, when set, overrides the initial level.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let filter = install_filter(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            layer_fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;
    Ok(())
}

/// Initialize logging to console plus a daily rolling file in `logs_dir`.
/// Returns a guard that must be kept alive for the duration of the process.
pub fn init_logging_to_dir(logs_dir: &Path, level: LogLevel) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "commhub");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = install_filter(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            layer_fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            layer_fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

fn install_filter(level: LogLevel) -> reload::Layer<EnvFilter, Registry> {
    CURRENT.store(level as u8, Ordering::Relaxed);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let (layer, handle) = reload::Layer::new(env_filter);
    // A second init in the same process keeps the first handle; its
    // subscriber is the one that is actually installed.
    let _ = FILTER.set(handle);
    layer
}

/// Change the verbosity of every component. Takes effect at emission time.
pub fn set_log_level(name: &str) -> Result<LogLevel, HubError> {
    let level = LogLevel::parse(name)?;
    CURRENT.store(level as u8, Ordering::Relaxed);
    if let Some(handle) = FILTER.get() {
        if let Err(e) = apply_level(handle, level) {
            tracing::warn!("log filter reload failed: {e}");
        }
    }
    tracing::info!("log level set to {level}");
    Ok(level)
}

fn apply_level<S>(
    handle: &reload::Handle<EnvFilter, S>,
    level: LogLevel,
) -> Result<(), reload::Error> {
    handle.reload(EnvFilter::new(level.as_str()))
}

/// The level most recently installed or requested.
pub fn current_level() -> LogLevel {
    LogLevel::from_u8(CURRENT.load(Ordering::Relaxed))
}
