//! Columnar encoding strategy

use crate::error::ExportError;

/// Converts the CSV rendering of a record set into a columnar file
pub trait ColumnarEncoder: Send + Sync {
    /// Encoder name for logs
    fn name(&self) -> &'static str;

    /// Encode a complete CSV document (header row included)
    fn encode(&self, csv: &[u8]) -> Result<Vec<u8>, ExportError>;
}

#[cfg(feature = "parquet")]
pub use self::parquet_encoder::ParquetEncoder;

#[cfg(feature = "parquet")]
mod parquet_encoder {
    use arrow::csv::ReaderBuilder;
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use parquet::arrow::ArrowWriter;
    use parquet::basic::Compression;
    use parquet::file::properties::WriterProperties;
    use regex::Regex;
    use std::io::Cursor;
    use std::sync::Arc;
    use tracing::debug;

    use super::ColumnarEncoder;
    use crate::error::ExportError;
    use crate::models::CSV_HEADER;

    /// Columns before this index are text; the metrics that follow are floats
    const FIRST_METRIC_COLUMN: usize = 15;
    const LAST_METRIC_COLUMN: usize = 30;

    /// Snappy-compressed Parquet encoder backed by Arrow
    #[derive(Debug, Clone)]
    pub struct ParquetEncoder {
        batch_size: usize,
    }

    impl Default for ParquetEncoder {
        fn default() -> Self {
            Self { batch_size: 8192 }
        }
    }

    impl ParquetEncoder {
        /// Arrow schema mirroring the CSV header
        pub fn schema() -> SchemaRef {
            let fields: Vec<Field> = CSV_HEADER
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let data_type = if (FIRST_METRIC_COLUMN..=LAST_METRIC_COLUMN).contains(&i) {
                        DataType::Float64
                    } else {
                        DataType::Utf8
                    };
                    Field::new(*name, data_type, false)
                })
                .collect();
            Arc::new(Schema::new(fields))
        }
    }

    impl ColumnarEncoder for ParquetEncoder {
        fn name(&self) -> &'static str {
            "parquet"
        }

        fn encode(&self, csv: &[u8]) -> Result<Vec<u8>, ExportError> {
            let schema = Self::schema();
            // Matches nothing: empty strings stay values, never nulls
            let never_null = Regex::new(r"^\b$")
                .map_err(|e| ExportError::Encode(e.to_string()))?;

            let reader = ReaderBuilder::new(schema.clone())
                .with_header(true)
                .with_batch_size(self.batch_size)
                .with_null_regex(never_null)
                .build(Cursor::new(csv))
                .map_err(|e| ExportError::Encode(format!("failed to read CSV: {}", e)))?;

            let props = WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .build();
            let mut out = Vec::new();
            let mut writer = ArrowWriter::try_new(&mut out, schema, Some(props))
                .map_err(|e| ExportError::Encode(format!("failed to create parquet writer: {}", e)))?;

            let mut rows = 0usize;
            for batch in reader {
                let batch =
                    batch.map_err(|e| ExportError::Encode(format!("failed to read CSV: {}", e)))?;
                rows += batch.num_rows();
                writer
                    .write(&batch)
                    .map_err(|e| ExportError::Encode(format!("failed to write parquet: {}", e)))?;
            }
            writer
                .close()
                .map_err(|e| ExportError::Encode(format!("failed to finish parquet: {}", e)))?;

            debug!(rows = rows, bytes = out.len(), "Encoded parquet artifact");
            Ok(out)
        }
    }

}
