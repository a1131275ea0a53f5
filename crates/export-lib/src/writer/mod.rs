//! Artifact serialization
//!
//! Encodes a materialized record set as CSV, JSON or Parquet. Parquet is
//! produced by converting the CSV rendering through an injected
//! [`ColumnarEncoder`], so the pipeline itself never links a columnar
//! library directly.

mod columnar;
mod delimited;
mod structured;

pub use columnar::ColumnarEncoder;
#[cfg(feature = "parquet")]
pub use columnar::ParquetEncoder;
pub use delimited::encode_csv;
pub use structured::encode_json;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::ExportError;
use crate::models::{AllocationRecord, ArtifactSummary, ExportFormat};

/// Filename prefix of every artifact
pub const ARTIFACT_PREFIX: &str = "opencost-allocation";

/// `opencost-allocation-<YYYYMMDD-HHMMSS>.<ext>`
pub fn artifact_filename(run_timestamp: DateTime<Utc>, format: ExportFormat) -> String {
    format!(
        "{}-{}.{}",
        ARTIFACT_PREFIX,
        run_timestamp.format("%Y%m%d-%H%M%S"),
        format.extension()
    )
}

/// A serialized, in-memory export artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub format: ExportFormat,
    pub record_count: usize,
    bytes: Bytes,
}

impl Artifact {
    pub fn new(
        filename: impl Into<String>,
        format: ExportFormat,
        record_count: usize,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            format,
            record_count,
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex SHA-256 of the artifact content
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            filename: self.filename.clone(),
            size_bytes: self.len(),
            sha256: self.sha256(),
        }
    }

    /// Save into `dir`, replacing any previous file of the same name
    ///
    /// Content goes to a `.partial` sibling first and is renamed into place,
    /// so readers never observe a half-written artifact.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(&self.filename);
        let staging = self.staging_path(dir);

        tokio::fs::write(&staging, &self.bytes).await?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!(path = %target.display(), bytes = self.len(), "Artifact saved locally");
        Ok(target)
    }

    /// Remove the staging file an interrupted [`save_to`](Self::save_to) left in `dir`
    pub async fn discard_staging(&self, dir: &Path) -> Result<(), ExportError> {
        match tokio::fs::remove_file(self.staging_path(dir)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn staging_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.partial", self.filename))
    }
}

/// Encodes records into artifacts
#[derive(Clone)]
pub struct ArtifactWriter {
    columnar: Option<Arc<dyn ColumnarEncoder>>,
}

impl Default for ArtifactWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactWriter {
    /// Writer with the built-in columnar encoder, if compiled in
    pub fn new() -> Self {
        #[cfg(feature = "parquet")]
        let columnar: Option<Arc<dyn ColumnarEncoder>> = Some(Arc::new(ParquetEncoder::default()));
        #[cfg(not(feature = "parquet"))]
        let columnar: Option<Arc<dyn ColumnarEncoder>> = None;

        Self { columnar }
    }

    /// Writer without any columnar encoder
    pub fn without_columnar() -> Self {
        Self { columnar: None }
    }

    pub fn with_columnar_encoder(mut self, encoder: Arc<dyn ColumnarEncoder>) -> Self {
        self.columnar = Some(encoder);
        self
    }

    /// Whether `format` can be produced by this writer
    pub fn supports(&self, format: ExportFormat) -> bool {
        format != ExportFormat::Parquet || self.columnar.is_some()
    }

    /// Serialize the full record set
    pub fn write(
        &self,
        records: &[AllocationRecord],
        format: ExportFormat,
        filename: impl Into<String>,
    ) -> Result<Artifact, ExportError> {
        let bytes = match format {
            ExportFormat::Csv => encode_csv(records)?,
            ExportFormat::Json => encode_json(records)?,
            ExportFormat::Parquet => {
                let encoder = self.columnar.as_ref().ok_or_else(|| {
                    ExportError::DependencyUnavailable(
                        "parquet output requested but no columnar encoder is available \
                         (built without the `parquet` feature)"
                            .to_string(),
                    )
                })?;
                let csv = encode_csv(records)?;
                encoder.encode(&csv)?
            }
        };

        Ok(Artifact::new(filename, format, records.len(), bytes))
    }
}
