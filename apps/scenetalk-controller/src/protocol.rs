//! Admin channel wire format.
//!
//! Inbound frames are JSON objects tagged by `op`. They are classified once,
//! in [`decode_admin_message`]; everything past that point works with typed
//! [`AdminMessage`] values. Outbound frames are [`AdminReply`] values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const OP_HELLO: &str = "hello";
pub const OP_LOG: &str = "log";
pub const OP_RESOLVE_FOR_COOK: &str = "resolve-for-cook";
pub const OP_FILE_RESOLVE: &str = "file_resolve";
pub const OP_FILE_UPLOAD: &str = "file_upload";

/// Reference to a catalog package. Lookup by `asset_id` wins over
/// `package_name` when both are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub package_name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub entry_point: Option<String>,
}

/// How a [`PackageRef`] is looked up in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageLookup<'a> {
    ById { asset_id: &'a str, version: &'a str },
    ByName { name: &'a str, version: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("package version is required")]
    MissingVersion,
    #[error("package needs an asset_id or a package_name")]
    MissingIdentity,
    #[error("file_id is required")]
    MissingFileId,
}

impl PackageRef {
    pub fn by_name(
        package_name: impl Into<String>,
        version: impl Into<String>,
        entry_point: Option<String>,
    ) -> Self {
        Self {
            asset_id: None,
            package_name: Some(package_name.into()),
            version: version.into(),
            entry_point,
        }
    }

    pub fn by_id(asset_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            asset_id: Some(asset_id.into()),
            package_name: None,
            version: version.into(),
            entry_point: None,
        }
    }

    pub fn lookup(&self) -> Result<PackageLookup<'_>, ValidationError> {
        let version = self.version.trim();
        if version.is_empty() {
            return Err(ValidationError::MissingVersion);
        }
        if let Some(asset_id) = non_blank(&self.asset_id) {
            return Ok(PackageLookup::ById { asset_id, version });
        }
        if let Some(name) = non_blank(&self.package_name) {
            return Ok(PackageLookup::ByName { name, version });
        }
        Err(ValidationError::MissingIdentity)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.lookup().map(|_| ())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (non_blank(&self.asset_id), non_blank(&self.package_name)) {
            (Some(asset_id), _) => write!(f, "asset:{asset_id}@{}", self.version)?,
            (None, Some(name)) => write!(f, "{name}-{}", self.version)?,
            (None, None) => write!(f, "<unnamed>-{}", self.version)?,
        }
        if let Some(entry_point) = &self.entry_point {
            write!(f, "/{entry_point}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveForCookRequest {
    pub package: PackageRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveFileRequest {
    pub data: FileRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub text: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LogRecord {
    /// Re-emits a worker log line under the `worker` target.
    pub fn emit(&self) {
        let text = self.text.as_str();
        match self.level.to_ascii_lowercase().as_str() {
            "info" => info!(target: "worker", "{text}"),
            "warning" | "warn" => warn!(target: "worker", "{text}"),
            "error" => error!(target: "worker", "{text}"),
            "debug" => debug!(target: "worker", "{text}"),
            other => error!(target: "worker", level = other, "unknown log level for message: {text}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogEnvelope {
    data: LogRecord,
}

/// An inbound admin message that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    ResolveForCook(ResolveForCookRequest),
    ResolveFile(ResolveFileRequest),
    Log(LogRecord),
}

/// Work the resolver knows how to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveRequest {
    ForCook(PackageRef),
    File { file_id: String },
}

impl ResolveRequest {
    pub fn op(&self) -> &'static str {
        match self {
            ResolveRequest::ForCook(_) => OP_RESOLVE_FOR_COOK,
            ResolveRequest::File { .. } => OP_FILE_RESOLVE,
        }
    }
}

impl fmt::Display for ResolveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveRequest::ForCook(package) => write!(f, "{OP_RESOLVE_FOR_COOK} {package}"),
            ResolveRequest::File { file_id } => write!(f, "{OP_FILE_RESOLVE} {file_id}"),
        }
    }
}

impl From<ResolveForCookRequest> for ResolveRequest {
    fn from(request: ResolveForCookRequest) -> Self {
        ResolveRequest::ForCook(request.package)
    }
}

impl From<ResolveFileRequest> for ResolveRequest {
    fn from(request: ResolveFileRequest) -> Self {
        ResolveRequest::File {
            file_id: request.data.file_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    pub file_id: String,
    pub file_path: String,
}

/// Frames the controller sends to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op")]
pub enum AdminReply {
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "file_upload")]
    FileUpload { data: FileUpload },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("no 'op' in message")]
    MissingOp,
    #[error("unknown op: {0}")]
    UnknownOp(String),
    #[error("malformed {op} message: {source}")]
    Invalid {
        op: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("rejected {op} message: {reason}")]
    Rejected {
        op: String,
        #[source]
        reason: ValidationError,
    },
}

pub fn decode_admin_message(text: &str) -> Result<AdminMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
    let op = value
        .get("op")
        .and_then(Value::as_str)
        .filter(|op| !op.is_empty())
        .ok_or(DecodeError::MissingOp)?
        .to_string();

    match op.as_str() {
        OP_LOG => {
            let envelope: LogEnvelope = parse_as(&op, value)?;
            Ok(AdminMessage::Log(envelope.data))
        }
        OP_RESOLVE_FOR_COOK => {
            let request: ResolveForCookRequest = parse_as(&op, value)?;
            request
                .package
                .validate()
                .map_err(|reason| DecodeError::Rejected { op, reason })?;
            Ok(AdminMessage::ResolveForCook(request))
        }
        OP_FILE_RESOLVE => {
            let request: ResolveFileRequest = parse_as(&op, value)?;
            if request.data.file_id.trim().is_empty() {
                return Err(DecodeError::Rejected {
                    op,
                    reason: ValidationError::MissingFileId,
                });
            }
            Ok(AdminMessage::ResolveFile(request))
        }
        _ => Err(DecodeError::UnknownOp(op)),
    }
}

fn parse_as<T: serde::de::DeserializeOwned>(op: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Invalid {
        op: op.to_string(),
        source,
    })
}
