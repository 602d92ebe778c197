//! Wires the controller's tasks together around one shutdown token.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use catalog_client::{Catalog, CatalogClient};
use tempfile::TempDir;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::advertise::AdvertiseBeacon;
use crate::bridge::AdminBridge;
use crate::command;
use crate::config::ControllerConfig;
use crate::resolver::{Downloader, Resolver};
use crate::supervisor::WorkerSupervisor;
use crate::work::{
    resolve_queue, response_queue, ResolveQueue, ResolveQueueReceiver, ResponseQueue,
    ResponseQueueReceiver,
};

/// Cache location; a temporary directory is removed when dropped.
#[derive(Debug)]
pub enum CacheDir {
    Provided(PathBuf),
    Temporary(TempDir),
}

impl CacheDir {
    pub fn prepare(path: Option<PathBuf>) -> io::Result<Self> {
        match path {
            Some(path) => Ok(CacheDir::Provided(path)),
            None => tempfile::Builder::new()
                .prefix("scenetalk-cache-")
                .tempdir()
                .map(CacheDir::Temporary),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            CacheDir::Provided(path) => path,
            CacheDir::Temporary(dir) => dir.path(),
        }
    }
}

/// Everything the controller's tasks share, built once at startup.
pub struct ControllerContext {
    pub config: ControllerConfig,
    pub controller_id: Uuid,
    pub catalog: Arc<dyn Catalog>,
    pub cache: CacheDir,
    pub shutdown: CancellationToken,
    pub jobs: ResolveQueue,
    jobs_rx: ResolveQueueReceiver,
    responses: ResponseQueue,
    replies_rx: ResponseQueueReceiver,
}

impl ControllerContext {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        let client =
            CatalogClient::new(config.catalog.clone()).context("failed to build catalog client")?;
        Self::with_catalog(config, Arc::new(client))
    }

    pub fn with_catalog(config: ControllerConfig, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let cache =
            CacheDir::prepare(config.cache_path.clone()).context("failed to prepare cache directory")?;
        let (jobs, jobs_rx) = resolve_queue();
        let (responses, replies_rx) = response_queue();
        Ok(Self {
            config,
            controller_id: Uuid::new_v4(),
            catalog,
            cache,
            shutdown: CancellationToken::new(),
            jobs,
            jobs_rx,
            responses,
            replies_rx,
        })
    }
}

/// Runs every enabled task until they have all finished. The first task
/// error cancels the rest and is returned once they are done.
pub async fn run(context: ControllerContext) -> Result<()> {
    let ControllerContext {
        config,
        controller_id,
        catalog,
        cache,
        shutdown,
        jobs,
        jobs_rx,
        responses,
        replies_rx,
    } = context;
    info!(
        %controller_id,
        cache_dir = %cache.path().display(),
        endpoint = %config.catalog.endpoint(),
        "controller starting"
    );

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // Queued before any consumer starts so the request cannot be missed.
    if let Some(line) = &config.exec {
        match command::exec_command(line, &jobs, &shutdown) {
            Ok(Some(waiter)) => {
                let label = line.clone();
                tasks.spawn(async move {
                    command::log_outcome(label, waiter).await;
                    Ok(())
                });
            }
            Ok(None) => {}
            Err(err) => error!(command = %line, error = %err, "exec command rejected"),
        }
    }

    let timeout = config.catalog.timeout;
    let downloader = Downloader::new(timeout, timeout).context("failed to build downloader")?;
    let resolver = Resolver::new(catalog.clone(), downloader, cache.path(), responses);
    let token = shutdown.clone();
    tasks.spawn(async move { resolver.run(jobs_rx, token).await.context("resolver failed") });

    // Without a worker nobody reads replies; keep the receiver alive anyway.
    let _idle_replies = match &config.worker {
        Some(worker) => {
            let supervisor = WorkerSupervisor::new(
                worker.clone(),
                config.client_endpoint.clone(),
                config.admin_endpoint(),
            );
            let bridge = AdminBridge::new(config.bridge.clone(), jobs.clone(), replies_rx);
            let token = shutdown.clone();
            tasks.spawn(async move {
                supervisor
                    .run(bridge, token)
                    .await
                    .context("worker supervisor failed")
            });
            None
        }
        None => Some(replies_rx),
    };

    if config.stdin {
        let (jobs, token) = (jobs.clone(), shutdown.clone());
        tasks.spawn(async move {
            command::run_stdin(jobs, token)
                .await
                .context("command reader failed")
        });
    }

    if let Some(endpoint) = &config.advertise {
        let beacon = AdvertiseBeacon::new(
            catalog.clone(),
            controller_id,
            Some(endpoint.clone()),
            config.advertise_interval,
        );
        let token = shutdown.clone();
        tasks.spawn(async move {
            beacon.run(token).await;
            Ok(())
        });
    }

    let token = shutdown.clone();
    tasks.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => Ok(()),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupt received; shutting down");
                token.cancel();
                Ok(())
            }
        }
    });
    drop(jobs);

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|err| anyhow!(err).context("controller task panicked or was cancelled"))
            .and_then(|result| result);
        if let Err(err) = result {
            error!(error = %format!("{err:#}"), "controller task failed");
            shutdown.cancel();
            first_error.get_or_insert(err);
        }
    }
    drop(cache);

    match first_error {
        Some(err) => Err(err),
        None => {
            info!("controller stopped");
            Ok(())
        }
    }
}
