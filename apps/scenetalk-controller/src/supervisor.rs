//! Launches the worker and ties its lifetime to the controller's.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{AdminBridge, BridgeError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch worker {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait on worker: {0}")]
    Wait(#[source] io::Error),
    #[error("worker exited with {0}")]
    WorkerExited(ExitStatus),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    worker: PathBuf,
    client_endpoint: String,
    admin_endpoint: String,
}

enum WorkerEvent {
    Exited(io::Result<ExitStatus>),
    BridgeFailed(BridgeError),
    Shutdown,
}

impl WorkerSupervisor {
    pub fn new(
        worker: impl Into<PathBuf>,
        client_endpoint: impl Into<String>,
        admin_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            worker: worker.into(),
            client_endpoint: client_endpoint.into(),
            admin_endpoint: admin_endpoint.into(),
        }
    }

    /// `<worker> --client <client_endpoint> --admin <admin_endpoint>`
    pub fn worker_command(&self) -> Command {
        let mut command = Command::new(&self.worker);
        command
            .arg("--client")
            .arg(&self.client_endpoint)
            .arg("--admin")
            .arg(&self.admin_endpoint)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Runs the worker next to `bridge`. Worker exit always cancels
    /// `shutdown`; a crashed worker is not restarted.
    pub async fn run(
        self,
        bridge: AdminBridge,
        shutdown: CancellationToken,
    ) -> Result<(), SupervisorError> {
        info!(
            worker = %self.worker.display(),
            client = %self.client_endpoint,
            admin = %self.admin_endpoint,
            "launching worker"
        );
        let mut child = self
            .worker_command()
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: self.worker.clone(),
                source,
            })?;
        debug!(pid = child.id(), "worker started");

        let bridge_task = bridge.run(shutdown.clone());
        tokio::pin!(bridge_task);
        let mut bridge_done = false;

        let event = loop {
            tokio::select! {
                status = child.wait() => break WorkerEvent::Exited(status),
                result = &mut bridge_task, if !bridge_done => {
                    bridge_done = true;
                    if let Err(err) = result {
                        break WorkerEvent::BridgeFailed(err);
                    }
                }
                _ = shutdown.cancelled() => break WorkerEvent::Shutdown,
            }
        };

        match event {
            WorkerEvent::Exited(status) => {
                shutdown.cancel();
                if !bridge_done {
                    if let Err(err) = (&mut bridge_task).await {
                        debug!(error = %err, "admin bridge ended after worker exit");
                    }
                }
                let status = status.map_err(SupervisorError::Wait)?;
                if status.success() {
                    info!(%status, "worker exited");
                    Ok(())
                } else {
                    error!(%status, "worker exited abnormally");
                    Err(SupervisorError::WorkerExited(status))
                }
            }
            WorkerEvent::BridgeFailed(err) => {
                error!(error = %err, "admin bridge failed; stopping worker");
                shutdown.cancel();
                stop(&mut child).await;
                Err(SupervisorError::Bridge(err))
            }
            WorkerEvent::Shutdown => {
                info!("shutdown requested; stopping worker");
                stop(&mut child).await;
                if !bridge_done {
                    if let Err(err) = (&mut bridge_task).await {
                        debug!(error = %err, "admin bridge ended during shutdown");
                    }
                }
                Ok(())
            }
        }
    }
}

async fn stop(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to signal worker");
    }
    match child.wait().await {
        Ok(status) => debug!(%status, "worker stopped"),
        Err(err) => warn!(error = %err, "failed to reap worker"),
    }
}
