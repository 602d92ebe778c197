use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILTER_ENV: &str = "SCENETALK_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "SCENETALK_TRACE_DEPS";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// When set, logs are also written to a timestamped file in this directory.
    pub log_dir: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to prepare log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceLock<Option<PathBuf>> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops and return the
/// log file chosen by the first call.
pub fn init(config: &LogConfig) -> Result<Option<PathBuf>, InitError> {
    if let Some(path) = INIT.get() {
        return Ok(path.clone());
    }
    let path = inner_init(config)?;
    let _ = INIT.set(path.clone());
    if let Some(path) = &path {
        tracing::info!(path = %path.display(), "logging to file");
    }
    Ok(path)
}

fn inner_init(config: &LogConfig) -> Result<Option<PathBuf>, InitError> {
    let level = config.level.to_filter();
    let (env_filter, throttled_deps) = build_env_filter(level);
    let verbose = config.level >= LogLevel::Debug;

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose);

    let (file_layer, path) = match &config.log_dir {
        Some(dir) => {
            let path = dir.join(log_file_name(Local::now()));
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(dir, &path)?);
            let _ = GUARD.set(guard);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    if throttled_deps {
        eprintln!(
            "[scenetalk-log] suppressing dependency trace noise; set {TRACE_DEPS_ENV}=1 or {LOG_FILTER_ENV} to override"
        );
    }
    Ok(path)
}

fn open_log_file(dir: &Path, path: &Path) -> Result<fs::File, InitError> {
    fs::create_dir_all(dir).map_err(|source| InitError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })
}

pub fn log_file_name(now: DateTime<Local>) -> String {
    now.format("scenetalk_%Y%m%d_%H%M%S.log").to_string()
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
        return (EnvFilter::new(filter), false);
    }
    let (filter, throttled) = default_filter_for(level, allow_dependency_traces());
    (EnvFilter::new(filter), throttled)
}

const TRACE_DEP_TARGETS: &[&str] = &[
    "hyper",
    "hyper_util",
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "rustls",
    "mio",
    "h2",
];

fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
    let base = match level {
        LevelFilter::TRACE => "info,scenetalk_controller=trace,catalog_client=trace,worker=trace",
        LevelFilter::DEBUG => "info,scenetalk_controller=debug,catalog_client=debug,worker=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    if level == LevelFilter::TRACE && !allow_deps {
        (throttle_dependency_traces(base), true)
    } else {
        (base.to_owned(), false)
    }
}

fn allow_dependency_traces() -> bool {
    std::env::var(TRACE_DEPS_ENV)
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false)
}

fn throttle_dependency_traces(base: &str) -> String {
    let mut filter = base.to_owned();
    for target in TRACE_DEP_TARGETS {
        filter.push(',');
        filter.push_str(target);
        filter.push_str("=info");
    }
    filter
}
