use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AttemptFailure, CatalogError};
use crate::retry::{is_retryable, RetryPolicy};
use crate::types::{select_version, AdvertiseAck, AssetRecord, DownloadInfo, WorkerAdvertisement};
use crate::Catalog;

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    endpoint: Url,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_idle_per_host: usize,
}

impl CatalogConfig {
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.mythica.gg";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 5;

    pub fn new(endpoint: impl AsRef<str>) -> Result<Self, CatalogError> {
        let raw = endpoint.as_ref().trim();
        let mut endpoint = Url::parse(raw)
            .map_err(|err| CatalogError::InvalidEndpoint(format!("{raw}: {err}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.cannot_be_a_base() {
            return Err(CatalogError::InvalidEndpoint(format!(
                "{raw}: expected an http(s) base url"
            )));
        }
        endpoint.set_query(None);
        endpoint.set_fragment(None);
        Ok(Self {
            endpoint,
            timeout: Self::DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            max_idle_per_host: Self::DEFAULT_MAX_IDLE_PER_HOST,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Catalog API client holding one connection pool for its whole lifetime.
/// Dropping the client closes the pool.
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    config: CatalogConfig,
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()
            .map_err(CatalogError::Client)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, CatalogError> {
        let mut url = self.config.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                CatalogError::InvalidEndpoint(format!("{} cannot be a base", self.config.endpoint))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_with_retry<B>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Response, CatalogError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let path = url.path().to_string();
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    AttemptFailure::Status(response.status())
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(CatalogError::NotFound {
                        path,
                        status: response.status(),
                    });
                }
                Ok(response) => return Ok(response),
                Err(err) if is_retryable(&err) => AttemptFailure::Transport(err),
                Err(source) => return Err(CatalogError::Transport { path, source }),
            };

            attempt += 1;
            if attempt >= policy.attempts {
                warn!(%path, attempts = attempt, error = %failure, "catalog request giving up");
                return Err(CatalogError::RetriesExhausted {
                    path,
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = policy.delay_for(attempt - 1);
            warn!(
                %path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "catalog request failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, CatalogError> {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        let response = self.send_with_retry(Method::GET, url, None::<&()>).await?;
        decode_json(&path, response).await
    }
}

async fn read_body(path: &str, response: Response) -> Result<Vec<u8>, CatalogError> {
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|source| CatalogError::Transport {
            path: path.to_string(),
            source,
        })
}

async fn decode_json<T: DeserializeOwned>(path: &str, response: Response) -> Result<T, CatalogError> {
    let body = read_body(path, response).await?;
    serde_json::from_slice(&body).map_err(|source| CatalogError::Decode {
        path: path.to_string(),
        source,
    })
}

#[async_trait]
impl Catalog for CatalogClient {
    async fn get_asset(&self, asset_id: &str, version: &str) -> Result<AssetRecord, CatalogError> {
        debug!(asset_id, version, "fetching asset by id");
        self.get_json(&["v1", "assets", asset_id, "versions", version])
            .await
    }

    async fn get_asset_by_name(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<AssetRecord>, CatalogError> {
        debug!(name, version, "fetching asset by name");
        let records: Vec<AssetRecord> = self.get_json(&["v1", "assets", "named", name]).await?;
        select_version(name, version, records)
    }

    async fn get_download_info(&self, file_id: &str) -> Result<DownloadInfo, CatalogError> {
        debug!(file_id, "fetching download info");
        self.get_json(&["v1", "download", "info", file_id]).await
    }

    async fn advertise(
        &self,
        advertisement: &WorkerAdvertisement,
    ) -> Result<AdvertiseAck, CatalogError> {
        let url = self.url(&["v1", "workers", "advertise"])?;
        let path = url.path().to_string();
        let response = self
            .send_with_retry(Method::POST, url, Some(advertisement))
            .await?;
        let body = read_body(&path, response).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(AdvertiseAck::default());
        }
        serde_json::from_slice(&body).map_err(|source| CatalogError::Decode { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_must_be_http() {
        assert!(CatalogConfig::new("ftp://catalog.example").is_err());
        assert!(CatalogConfig::new("not a url").is_err());
        assert!(CatalogConfig::new("http://localhost:5555").is_ok());
    }

    #[test]
    fn paths_are_joined_and_escaped() {
        let config = CatalogConfig::new("https://api.example.com/").unwrap();
        let client = CatalogClient::new(config).unwrap();
        let url = client.url(&["v1", "assets", "named", "rock pack"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/assets/named/rock%20pack");
    }

    #[test]
    fn endpoint_prefix_is_kept() {
        let config = CatalogConfig::new("https://example.com/api").unwrap();
        let client = CatalogClient::new(config).unwrap();
        let url = client.url(&["v1", "download", "info", "file_1"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/v1/download/info/file_1");
    }
}
