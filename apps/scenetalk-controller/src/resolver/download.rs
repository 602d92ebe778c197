use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const FALLBACK_FILE_NAME: &str = "download";

static DISPOSITION_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"filename="?([^";]+)"?"#).expect("valid content-disposition pattern"));

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to build download client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("download of {url} stalled for {}s", idle.as_secs_f32())]
    Stalled { url: String, idle: Duration },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to extract {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `.{name}.part` file that is removed on drop unless it was persisted.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    async fn persist(mut self, dest: &Path) -> Result<(), DownloadError> {
        fs::rename(&self.path, dest).await.map_err(io_error(dest))?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial download"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove partial download"),
        }
    }
}

/// Streams artifacts from download URLs into the cache directory.
#[derive(Clone)]
pub struct Downloader {
    http: reqwest::Client,
    idle_timeout: Duration,
}

impl Downloader {
    /// `connect_timeout` bounds connection setup. Bodies can be large, so
    /// there is no total deadline; instead every wait for response headers
    /// or the next body chunk is bounded by `idle_timeout`.
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Result<Self, DownloadError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(DownloadError::Client)?;
        Ok(Self { http, idle_timeout })
    }

    fn stalled(&self, url: &str) -> DownloadError {
        DownloadError::Stalled {
            url: url.to_string(),
            idle: self.idle_timeout,
        }
    }

    /// Downloads `url` into `dir`. The file is named `file_name` when given,
    /// otherwise after the response's `Content-Disposition` or URL tail.
    pub async fn fetch(
        &self,
        url: &str,
        dir: &Path,
        file_name: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        let response = timeout(self.idle_timeout, self.http.get(url).send())
            .await
            .map_err(|_| self.stalled(url))?
            .map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status,
            });
        }

        let name = match file_name.and_then(final_component) {
            Some(name) => name,
            None => response_file_name(response.headers(), response.url()),
        };
        let path = dir.join(&name);

        let partial = PartialFile::new(dir.join(format!(".{name}.part")));
        let mut file = File::create(&partial.path).await.map_err(io_error(&partial.path))?;
        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        loop {
            let next = timeout(self.idle_timeout, body.next())
                .await
                .map_err(|_| self.stalled(url))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|source| DownloadError::Request {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(io_error(&partial.path))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error(&partial.path))?;
        drop(file);
        partial.persist(&path).await?;

        info!(url, path = %path.display(), bytes = written, "download complete");
        Ok(path)
    }
}

/// File name announced by the server, else the last URL path segment.
pub fn response_file_name(headers: &HeaderMap, url: &Url) -> String {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DISPOSITION_FILENAME.captures(value))
        .and_then(|captures| captures.get(1))
        .and_then(|name| final_component(name.as_str()))
        .or_else(|| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(final_component)
        })
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// Last path component of `raw`, so a name can never leave the cache dir.
fn final_component(raw: &str) -> Option<String> {
    let name = raw.trim().rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// `image/png; charset=binary` -> `png`.
pub fn extension_for_content_type(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next()?.trim();
    let (kind, subtype) = essence.split_once('/')?;
    let subtype = subtype.trim();
    if kind.trim().is_empty()
        || subtype.is_empty()
        || subtype.contains(['/', '\\'])
        || subtype.starts_with('.')
    {
        return None;
    }
    Some(subtype.to_ascii_lowercase())
}

pub fn is_zip_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Extracts `archive` into a sibling directory named after its stem and
/// returns that directory.
pub async fn extract_archive(archive: PathBuf) -> Result<PathBuf, DownloadError> {
    let target = archive.with_extension("");
    let dest = target.clone();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest)).await??;
    Ok(target)
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<(), DownloadError> {
    let file = std::fs::File::open(archive).map_err(io_error(archive))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|source| DownloadError::Archive {
        path: archive.to_path_buf(),
        source,
    })?;
    std::fs::create_dir_all(dest).map_err(io_error(dest))?;
    // Entries with absolute or `..` paths are rejected by the extractor.
    zip.extract(dest).map_err(|source| DownloadError::Archive {
        path: archive.to_path_buf(),
        source,
    })?;
    debug!(
        archive = %archive.display(),
        dest = %dest.display(),
        entries = zip.len(),
        "archive extracted"
    );
    Ok(())
}
