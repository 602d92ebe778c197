use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::CatalogError;

/// An asset as returned by the catalog. Only the fields the controller acts
/// on are typed; the rest is kept in `extra` for logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssetRecord {
    /// Version array rendered as a dotted string, e.g. `[1, 0, 3]` -> `1.0.3`.
    /// Anything other than an array renders as `unknown`.
    pub fn formatted_version(&self) -> String {
        match &self.version {
            Some(Value::Array(parts)) => parts
                .iter()
                .map(|part| match part {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("."),
            _ => "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAdvertisement {
    pub controller_id: Uuid,
    pub process_id: String,
    pub public_endpoint: Option<String>,
    pub host_keys: Vec<String>,
}

impl WorkerAdvertisement {
    pub fn for_current_process(controller_id: Uuid, public_endpoint: Option<String>) -> Self {
        Self {
            controller_id,
            process_id: std::process::id().to_string(),
            public_endpoint,
            host_keys: Vec::new(),
        }
    }
}

/// Whatever the advertise endpoint answered with; `Null` for an empty body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdvertiseAck {
    pub body: Value,
}

/// Picks the record whose formatted version equals `version`.
///
/// Returns `Ok(None)` for an empty record list. When records exist but none
/// match, the error lists every version that was seen, in server order.
pub fn select_version(
    name: &str,
    version: &str,
    records: Vec<AssetRecord>,
) -> Result<Option<AssetRecord>, CatalogError> {
    if records.is_empty() {
        return Ok(None);
    }
    let mut available = Vec::with_capacity(records.len());
    for record in records {
        let formatted = record.formatted_version();
        if formatted == version {
            return Ok(Some(record));
        }
        available.push(formatted);
    }
    Err(CatalogError::VersionNotFound {
        name: name.to_string(),
        version: version.to_string(),
        available,
    })
}
