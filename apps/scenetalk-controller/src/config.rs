use std::path::PathBuf;
use std::time::Duration;

use catalog_client::{CatalogConfig, CatalogError, RetryPolicy};
use clap::Parser;
use thiserror::Error;

use crate::bridge::BridgeConfig;
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "scenetalk-controller",
    version,
    about = "Sidecar that supervises the procedural worker and resolves its packages"
)]
pub struct Cli {
    /// File system path for package caching. Defaults to a temporary
    /// directory removed at exit.
    #[arg(long, env = "SCENETALK_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Base URL of the catalog API.
    #[arg(long, env = "SCENETALK_ENDPOINT", default_value = CatalogConfig::DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Path to the worker executable. Without it no worker is launched.
    #[arg(long, env = "SCENETALK_WORKER")]
    pub worker: Option<PathBuf>,

    /// Port for client websocket connections.
    #[arg(long = "clientport", env = "SCENETALK_CLIENT_PORT", default_value_t = 8765)]
    pub client_port: u16,

    /// Port for admin websocket connections.
    #[arg(long = "adminport", env = "SCENETALK_ADMIN_PORT", default_value_t = 9876)]
    pub admin_port: u16,

    /// Enable console commands from stdin.
    #[arg(long, env = "SCENETALK_STDIN", default_value_t = false)]
    pub stdin: bool,

    /// Command to execute at startup, e.g. "resolve crystal_pack-1.0".
    #[arg(long, env = "SCENETALK_EXEC")]
    pub exec: Option<String>,

    /// Public endpoint to advertise this controller under.
    #[arg(long, env = "SCENETALK_ADVERTISE")]
    pub advertise: Option<String>,

    #[arg(long, env = "SCENETALK_ADVERTISE_INTERVAL_SECS", default_value_t = 3)]
    pub advertise_interval_secs: u64,

    /// Directory to store log files.
    #[arg(long = "logdir", env = "SCENETALK_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "SCENETALK_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Catalog request attempts before giving up.
    #[arg(long, env = "SCENETALK_RETRY_ATTEMPTS", default_value_t = RetryPolicy::DEFAULT_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Base delay of the catalog retry backoff.
    #[arg(long, env = "SCENETALK_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Catalog request timeout, and the longest a download may go without
    /// receiving data.
    #[arg(long, env = "SCENETALK_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Attempts to reach the worker's admin endpoint while it starts.
    #[arg(
        long,
        env = "SCENETALK_ADMIN_CONNECT_ATTEMPTS",
        default_value_t = BridgeConfig::DEFAULT_CONNECT_ATTEMPTS
    )]
    pub admin_connect_attempts: u32,

    #[arg(long, env = "SCENETALK_ADMIN_CONNECT_DELAY_SECS", default_value_t = 3)]
    pub admin_connect_delay_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Endpoint(#[from] CatalogError),
    #[error("{0} must not be zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub cache_path: Option<PathBuf>,
    pub catalog: CatalogConfig,
    pub worker: Option<PathBuf>,
    pub client_endpoint: String,
    pub bridge: BridgeConfig,
    pub stdin: bool,
    pub exec: Option<String>,
    pub advertise: Option<String>,
    pub advertise_interval: Duration,
    pub log: LogConfig,
}

impl ControllerConfig {
    pub fn admin_endpoint(&self) -> &str {
        &self.bridge.admin_endpoint
    }
}

impl TryFrom<Cli> for ControllerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.client_port == 0 {
            return Err(ConfigError::Zero("--clientport"));
        }
        if cli.admin_port == 0 {
            return Err(ConfigError::Zero("--adminport"));
        }
        if cli.retry_attempts == 0 {
            return Err(ConfigError::Zero("--retry-attempts"));
        }
        if cli.http_timeout_secs == 0 {
            return Err(ConfigError::Zero("--http-timeout-secs"));
        }

        let catalog = CatalogConfig::new(&cli.endpoint)?
            .with_timeout(Duration::from_secs(cli.http_timeout_secs))
            .with_retry(RetryPolicy::new(
                cli.retry_attempts,
                Duration::from_millis(cli.retry_backoff_ms),
            ));

        let bridge = BridgeConfig {
            admin_endpoint: format!("ws://localhost:{}", cli.admin_port),
            connect_attempts: cli.admin_connect_attempts.max(1),
            connect_delay: Duration::from_secs(cli.admin_connect_delay_secs),
        };

        Ok(ControllerConfig {
            cache_path: normalize_path(cli.cache_path),
            catalog,
            worker: normalize_path(cli.worker),
            client_endpoint: format!("ws://0.0.0.0:{}", cli.client_port),
            bridge,
            stdin: cli.stdin,
            exec: normalize_opt(cli.exec),
            advertise: normalize_opt(cli.advertise),
            advertise_interval: Duration::from_secs(cli.advertise_interval_secs.max(1)),
            log: LogConfig {
                level: cli.log_level,
                log_dir: normalize_path(cli.log_dir),
            },
        })
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn normalize_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|path| !path.as_os_str().is_empty())
}
