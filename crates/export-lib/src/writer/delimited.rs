//! CSV encoding

use crate::error::ExportError;
use crate::models::{AllocationRecord, CSV_HEADER};

/// Header row plus one row per record; the header is written even when empty
pub fn encode_csv(records: &[AllocationRecord]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(256 * (records.len() + 1)));

    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }

    writer
        .into_inner()
        .map_err(|e| ExportError::Encode(format!("failed to flush CSV: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::sample_record;

    #[test]
    fn test_empty_set_is_header_only() {
        let bytes = encode_csv(&[]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, format!("{}\n", CSV_HEADER.join(",")));
    }

    #[test]
    fn test_header_is_exact() {
        let text = String::from_utf8(encode_csv(&[sample_record("a")]).unwrap()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "WindowStart,WindowEnd,Name,Cluster,Namespace,ControllerKind,Controller,Pod,Container,Node,\
             Team,Project,Environment,CostCenter,App,CPUCoreHours,CPUCoreRequestAverage,\
             CPUCoreUsageAverage,RAMByteHours,RAMBytesRequestAverage,RAMBytesUsageAverage,CPUCost,\
             RAMCost,GPUCost,PVCost,NetworkCost,LoadBalancerCost,SharedCost,ExternalCost,TotalCost,\
             TotalEfficiency,ExportTimestamp"
        );
    }

    #[test]
    fn test_round_trip_through_csv_reader() {
        let mut unknown_window = sample_record("b");
        unknown_window.window_start = None;
        unknown_window.window_end = None;
        let records = vec![sample_record("a"), unknown_window];

        let bytes = encode_csv(&records).unwrap();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let parsed: Vec<AllocationRecord> = reader
            .deserialize()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(parsed, records);
    }

    #[test]
    fn test_delimiters_and_quotes_are_escaped() {
        let text = String::from_utf8(encode_csv(&[sample_record("a")]).unwrap()).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains("\"payments, core\""));
        assert!(row.contains("\"say \"\"hi\"\"\""));
        assert!(row.starts_with("2024-01-01T00:00:00Z,2024-01-02T00:00:00Z,a,"));
        assert!(row.ends_with(",2024-01-03T04:05:06Z"));
    }
}
