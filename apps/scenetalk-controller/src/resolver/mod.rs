//! Turns queued resolve requests into files in the cache directory.

pub mod download;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use catalog_client::{Catalog, CatalogError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::protocol::{AdminReply, FileUpload, PackageLookup, PackageRef, ResolveRequest, ValidationError};
use crate::work::{QueueClosed, ResolveJob, ResolveOutcome, ResolveQueueReceiver, ResponseQueue};

pub use download::{DownloadError, Downloader};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("no package named {name} (wanted version {version}) in the catalog")]
    UnknownPackage { name: String, version: String },
    #[error("asset for {package} has no package_id")]
    MissingPackageId { package: String },
    #[error("file {file_id} has unusable content type {content_type:?}")]
    InvalidContentType {
        file_id: String,
        content_type: Option<String>,
    },
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("cache directory {} is unusable: {source}", path.display())]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Responses(#[from] QueueClosed),
}

pub struct Resolver {
    catalog: Arc<dyn Catalog>,
    downloader: Downloader,
    cache_dir: PathBuf,
    responses: ResponseQueue,
}

impl Resolver {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        downloader: Downloader,
        cache_dir: impl Into<PathBuf>,
        responses: ResponseQueue,
    ) -> Self {
        Self {
            catalog,
            downloader,
            cache_dir: cache_dir.into(),
            responses,
        }
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Consumes jobs in arrival order until shutdown. A failing job is
    /// logged and completed as `Failed`; it never stops the loop.
    pub async fn run(
        self,
        mut jobs: ResolveQueueReceiver,
        shutdown: CancellationToken,
    ) -> Result<(), ResolveError> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|source| ResolveError::CacheDir {
                path: self.cache_dir.clone(),
                source,
            })?;
        info!(cache_dir = %self.cache_dir.display(), "resolver started");

        while let Some(ResolveJob {
            request,
            completion,
        }) = jobs.next(&shutdown).await
        {
            debug!(op = request.op(), %request, "resolving");
            let outcome = match self.resolve(&request).await {
                Ok(path) => {
                    info!(op = request.op(), %request, path = %path.display(), "resolved");
                    ResolveOutcome::Resolved(path)
                }
                Err(err) => {
                    error!(op = request.op(), %request, error = %err, "resolve failed");
                    ResolveOutcome::Failed(err.to_string())
                }
            };
            completion.complete(outcome);
        }

        info!("resolver stopped");
        Ok(())
    }

    pub async fn resolve(&self, request: &ResolveRequest) -> Result<PathBuf, ResolveError> {
        match request {
            ResolveRequest::ForCook(package) => self.resolve_for_cook(package).await,
            ResolveRequest::File { file_id } => self.resolve_file(file_id).await,
        }
    }

    /// Downloads the package behind `package`; zip archives resolve to their
    /// extracted directory.
    pub async fn resolve_for_cook(&self, package: &PackageRef) -> Result<PathBuf, ResolveError> {
        let asset = match package.lookup()? {
            PackageLookup::ById { asset_id, version } => {
                self.catalog.get_asset(asset_id, version).await?
            }
            PackageLookup::ByName { name, version } => self
                .catalog
                .get_asset_by_name(name, version)
                .await?
                .ok_or_else(|| ResolveError::UnknownPackage {
                    name: name.to_string(),
                    version: version.to_string(),
                })?,
        };
        let package_id = asset
            .package_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ResolveError::MissingPackageId {
                package: package.to_string(),
            })?;
        debug!(%package, package_id, version = %asset.formatted_version(), "asset located");

        let info = self.catalog.get_download_info(package_id).await?;
        let path = self
            .downloader
            .fetch(&info.url, &self.cache_dir, None)
            .await?;
        if download::is_zip_archive(&path) {
            return Ok(download::extract_archive(path).await?);
        }
        Ok(path)
    }

    /// Downloads a single file as `{file_id}.{ext}` and tells the worker
    /// where it landed.
    pub async fn resolve_file(&self, file_id: &str) -> Result<PathBuf, ResolveError> {
        let info = self.catalog.get_download_info(file_id).await?;
        let extension = info
            .content_type
            .as_deref()
            .and_then(download::extension_for_content_type)
            .ok_or_else(|| ResolveError::InvalidContentType {
                file_id: file_id.to_string(),
                content_type: info.content_type.clone(),
            })?;
        let file_name = format!("{file_id}.{extension}");
        let path = self
            .downloader
            .fetch(&info.url, &self.cache_dir, Some(&file_name))
            .await?;

        self.responses.send(AdminReply::FileUpload {
            data: FileUpload {
                file_id: file_id.to_string(),
                file_path: path.display().to_string(),
            },
        })?;
        Ok(path)
    }
}
