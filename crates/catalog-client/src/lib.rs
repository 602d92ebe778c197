//! Asynchronous client for the asset catalog API.
//!
//! The controller resolves packages and files through this crate. Calls go
//! through one pooled [`reqwest::Client`] and a bounded exponential retry
//! policy; callers that need a fake (resolver and beacon tests) program
//! against the [`Catalog`] trait instead of [`CatalogClient`].

mod client;
mod error;
mod retry;
mod types;

use async_trait::async_trait;

pub use client::{CatalogClient, CatalogConfig};
pub use error::{AttemptFailure, CatalogError};
pub use retry::RetryPolicy;
pub use types::{
    select_version, AdvertiseAck, AssetRecord, DownloadInfo, WorkerAdvertisement,
};

/// Operations the controller needs from the catalog service.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// `GET /v1/assets/{asset_id}/versions/{version}`.
    async fn get_asset(&self, asset_id: &str, version: &str) -> Result<AssetRecord, CatalogError>;

    /// `GET /v1/assets/named/{name}`, then picks the record whose formatted
    /// version equals `version`. `Ok(None)` means the name is unknown.
    async fn get_asset_by_name(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<AssetRecord>, CatalogError>;

    /// `GET /v1/download/info/{file_id}`.
    async fn get_download_info(&self, file_id: &str) -> Result<DownloadInfo, CatalogError>;

    /// `POST /v1/workers/advertise`.
    async fn advertise(
        &self,
        advertisement: &WorkerAdvertisement,
    ) -> Result<AdvertiseAck, CatalogError>;
}
