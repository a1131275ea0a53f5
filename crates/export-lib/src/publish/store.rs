//! `object_store`-backed publisher for Azure Blob Storage and local directories

use async_trait::async_trait;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMode, PutOptions, PutPayload,
    RetryConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::{PublishReceipt, Publisher};
use crate::error::ExportError;
use crate::writer::Artifact;

/// Where artifacts are uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// Azure Blob Storage container; the key falls back to the `AZURE_*` environment
    Azure {
        account: String,
        container: String,
        access_key: Option<String>,
    },
    /// Directory on the local filesystem
    Local { root: PathBuf },
    /// Process-local store, used by tests and dry runs
    Memory,
}

/// Publisher over any `ObjectStore` backend
///
/// Each upload is a single put, which every backend applies as an atomic
/// replacement: a cancelled upload leaves the previous blob (or nothing)
/// at the target path.
pub struct ObjectStorePublisher {
    store: Arc<dyn ObjectStore>,
    canonical_url: String,
    supports_attributes: bool,
}

impl std::fmt::Debug for ObjectStorePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStorePublisher<{}>", self.canonical_url)
    }
}

impl ObjectStorePublisher {
    /// Build a publisher for `target`
    pub fn new(target: &StorageTarget) -> Result<Self, ExportError> {
        match target {
            StorageTarget::Azure {
                account,
                container,
                access_key,
            } => {
                if account.is_empty() || container.is_empty() {
                    return Err(ExportError::Config(
                        "storage account and container are both required".to_string(),
                    ));
                }
                // Retries are owned by the export runner
                let retry = RetryConfig {
                    max_retries: 0,
                    ..RetryConfig::default()
                };
                let mut builder = MicrosoftAzureBuilder::from_env()
                    .with_account(account)
                    .with_container_name(container)
                    .with_retry(retry);
                if let Some(key) = access_key {
                    builder = builder.with_access_key(key);
                }
                let store = builder
                    .build()
                    .map_err(|e| ExportError::Config(format!("invalid Azure storage settings: {}", e)))?;

                info!(account = %account, container = %container, "Using Azure Blob Storage");
                Ok(Self {
                    store: Arc::new(store),
                    canonical_url: format!("https://{}.blob.core.windows.net/{}", account, container),
                    supports_attributes: true,
                })
            }
            StorageTarget::Local { root } => {
                std::fs::create_dir_all(root)?;
                let store = LocalFileSystem::new_with_prefix(root).map_err(|e| {
                    ExportError::Config(format!("invalid local directory {}: {}", root.display(), e))
                })?;
                Ok(Self {
                    store: Arc::new(store),
                    canonical_url: format!("file://{}", root.display()),
                    supports_attributes: false,
                })
            }
            StorageTarget::Memory => Ok(Self::from_store(Arc::new(InMemory::new()), "memory://")),
        }
    }

    /// Wrap an existing store
    pub fn from_store(store: Arc<dyn ObjectStore>, canonical_url: impl Into<String>) -> Self {
        Self {
            store,
            canonical_url: canonical_url.into(),
            supports_attributes: true,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn put_options(&self, artifact: &Artifact, sha256: &str) -> PutOptions {
        let attributes = if self.supports_attributes {
            Attributes::from_iter([
                (
                    Attribute::ContentType,
                    AttributeValue::from(artifact.format.content_type()),
                ),
                (
                    Attribute::Metadata("sha256".into()),
                    AttributeValue::from(sha256.to_string()),
                ),
            ])
        } else {
            Attributes::new()
        };

        PutOptions {
            mode: PutMode::Overwrite,
            attributes,
            ..PutOptions::default()
        }
    }
}

#[async_trait]
impl Publisher for ObjectStorePublisher {
    async fn publish(&self, artifact: &Artifact, path: &str) -> Result<PublishReceipt, ExportError> {
        let location = Path::parse(path)
            .map_err(|e| ExportError::Config(format!("invalid blob path '{}': {}", path, e)))?;
        let sha256 = artifact.sha256();
        let opts = self.put_options(artifact, &sha256);
        let payload = PutPayload::from(artifact.bytes().clone());

        let result = self
            .store
            .put_opts(&location, payload, opts)
            .await
            .map_err(classify_store_error)?;

        debug!(
            location = %location,
            bytes = artifact.len(),
            e_tag = ?result.e_tag,
            "Artifact uploaded"
        );

        Ok(PublishReceipt {
            location: format!("{}/{}", self.canonical_url, location),
            size_bytes: artifact.len(),
            sha256,
            e_tag: result.e_tag,
        })
    }

    fn describe(&self) -> String {
        self.canonical_url.clone()
    }
}

/// Markers of rejected credentials in storage error messages
const AUTH_MARKERS: &[&str] = &[
    "authenticationfailed",
    "authorizationfailure",
    "authorizationpermissionmismatch",
    "invalidauthenticationinfo",
    "401 unauthorized",
    "403 forbidden",
    "status: 401",
    "status: 403",
];

/// Split storage failures into fatal credential errors and retryable ones
pub(crate) fn classify_store_error(err: object_store::Error) -> ExportError {
    use object_store::Error;

    match &err {
        Error::Unauthenticated { .. } | Error::PermissionDenied { .. } => {
            ExportError::Auth(err.to_string())
        }
        Error::NotImplemented | Error::InvalidPath { .. } | Error::UnknownConfigurationKey { .. } => {
            ExportError::Config(err.to_string())
        }
        _ => {
            let message = err.to_string();
            let lowered = message.to_ascii_lowercase();
            if AUTH_MARKERS.iter().any(|m| lowered.contains(m)) {
                ExportError::Auth(message)
            } else {
                ExportError::Upload(message)
            }
        }
    }
}
