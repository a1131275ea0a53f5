//! JSON encoding

use crate::error::ExportError;
use crate::models::AllocationRecord;

/// Pretty-printed array of records keyed by the CSV column names
pub fn encode_json(records: &[AllocationRecord]) -> Result<Vec<u8>, ExportError> {
    serde_json::to_vec_pretty(records).map_err(|e| ExportError::Encode(e.to_string()))
}
