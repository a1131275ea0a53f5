//! Artifact publication to object storage
//!
//! Artifacts land at `<prefix>/<yyyy>/<mm>/<dd>/<filename>` with overwrite
//! semantics, so re-running an export for the same day and filename
//! replaces the previous blob instead of adding a second one.

mod store;

pub use store::{ObjectStorePublisher, StorageTarget};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::writer::Artifact;

/// Default blob prefix
pub const DEFAULT_BLOB_PREFIX: &str = "opencost-allocation";

/// Date-partitioned blob path for an artifact
pub fn blob_path(prefix: &str, date: DateTime<Utc>, filename: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let partition = date.format("%Y/%m/%d");
    if prefix.is_empty() {
        format!("{}/{}", partition, filename)
    } else {
        format!("{}/{}/{}", prefix, partition, filename)
    }
}

/// Proof of a completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Fully qualified location of the blob
    pub location: String,
    pub size_bytes: usize,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
}

/// Destination for finished artifacts
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Upload `artifact` to `path`, replacing any existing blob
    async fn publish(&self, artifact: &Artifact, path: &str) -> Result<PublishReceipt, ExportError>;

    /// Human-readable destination for logs
    fn describe(&self) -> String;
}
