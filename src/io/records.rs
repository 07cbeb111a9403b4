//! Reading input records and writing merged reports.
//!
//! Records come from a JSON array of objects or a CSV file with a header row.
//! Reports are written as pretty JSON or as one CSV row per record. The
//! format is picked from the file extension.

use crate::model::Record;
use crate::report::MergedReport;
use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Csv,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Ok(FileFormat::Json),
            Some("csv") => Ok(FileFormat::Csv),
            _ => bail!("Unsupported file type for {} (expected .json or .csv)", path.display()),
        }
    }
}

/// Read records from `path`, taking each record's key from `key_field`.
///
/// The key column is moved out of the record's fields. Rows without a key,
/// and keys that appear twice, are rejected.
pub fn read_records(path: &Path, key_field: &str) -> Result<Vec<Record>> {
    let rows = match FileFormat::from_path(path)? {
        FileFormat::Json => read_json_rows(path)?,
        FileFormat::Csv => read_csv_rows(path)?,
    };

    let mut seen = HashSet::with_capacity(rows.len());
    let mut records = Vec::with_capacity(rows.len());

    for (row, mut fields) in rows.into_iter().enumerate() {
        let key = match fields.remove(key_field) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => bail!(
                "Row {}: key field '{}' is not a scalar: {}",
                row + 1,
                key_field,
                other
            ),
        };
        if key.is_empty() {
            bail!("Row {}: missing key field '{}'", row + 1, key_field);
        }
        if !seen.insert(key.clone()) {
            bail!("Row {}: duplicate key '{}'", row + 1, key);
        }
        records.push(Record { key, fields });
    }

    tracing::info!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}

fn read_json_rows(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let rows: Vec<Map<String, Value>> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of objects", path.display()))?;
    Ok(rows)
}

fn read_csv_rows(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV parse error at row {}", row_idx + 1))?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Write `report` to `path`. `key_field` names the key column in CSV output.
pub fn write_report(path: &Path, report: &MergedReport, key_field: &str) -> Result<()> {
    match FileFormat::from_path(path)? {
        FileFormat::Json => {
            let json = serde_json::to_string_pretty(report)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        FileFormat::Csv => write_report_csv(path, report, key_field)?,
    }
    tracing::info!("Report written to {}", path.display());
    Ok(())
}

fn write_report_csv(path: &Path, report: &MergedReport, key_field: &str) -> Result<()> {
    // Union of record columns, in name order
    let columns: BTreeSet<&str> = report
        .entries()
        .flat_map(|e| e.record.fields.keys().map(String::as_str))
        .filter(|name| *name != key_field)
        .collect();

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec![key_field, "group", "matched", "quality"];
    header.extend(columns.iter().copied());
    writer.write_record(&header)?;

    for entry in report.entries() {
        let mut row = vec![
            entry.record.key.clone(),
            entry.group.clone(),
            entry.matched.to_string(),
            entry.quality.to_string(),
        ];
        for column in &columns {
            row.push(match entry.record.fields.get(*column) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            });
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReconciledRecord;

    #[test]
    fn test_read_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "serial,agent,amount\nSN1, north ,10\nSN2,south,\n").unwrap();

        let records = read_records(&path, "serial").unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "SN1");
        assert_eq!(records[0].fields.get("agent"), Some(&Value::String("north".into())));
        assert!(records[0].fields.get("serial").is_none());
        assert!(records[1].fields.get("amount").is_none());
    }

    #[test]
    fn test_read_json_numeric_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.json");
        std::fs::write(&path, r#"[{"serial": 1001, "agent": "a"}, {"serial": "1002"}]"#).unwrap();

        let records = read_records(&path, "serial").unwrap();
        assert_eq!(records[0].key, "1001");
        assert_eq!(records[1].key, "1002");
    }

    #[test]
    fn test_rejects_missing_and_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.csv");
        std::fs::write(&missing, "serial,agent\nSN1,a\n,b\n").unwrap();
        let err = read_records(&missing, "serial").unwrap_err();
        assert!(err.to_string().contains("Row 2"));

        let duplicate = dir.path().join("dup.json");
        std::fs::write(&duplicate, r#"[{"serial": "A"}, {"serial": "A"}]"#).unwrap();
        let err = read_records(&duplicate, "serial").unwrap_err();
        assert!(err.to_string().contains("duplicate key 'A'"));
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(FileFormat::from_path(Path::new("records.xlsx")).is_err());
        assert_eq!(FileFormat::from_path(Path::new("R.CSV")).unwrap(), FileFormat::Csv);
    }

    #[test]
    fn test_write_report_csv_and_json() {
        let records = vec![
            Record::new("SN1").with_field("agent", "north"),
            Record::new("SN2").with_field("amount", 12),
        ];
        let reconciled = vec![ReconciledRecord {
            key: "SN1".into(),
            matched: true,
            quality: true,
            group: Some("north".into()),
            attributes: Default::default(),
        }];
        let report = MergedReport::build(&records, reconciled, None);
        let dir = tempfile::tempdir().unwrap();

        let csv_path = dir.path().join("report.csv");
        write_report(&csv_path, &report, "serial").unwrap();
        let csv = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "serial,group,matched,quality,agent,amount");
        assert_eq!(lines[1], "SN1,north,true,true,north,");
        assert_eq!(lines[2], "SN2,unassigned,false,false,,12");

        let json_path = dir.path().join("report.json");
        write_report(&json_path, &report, "serial").unwrap();
        let text = std::fs::read_to_string(&json_path).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["totals"]["total"], 2);
        assert_eq!(value["groups"]["north"]["counts"]["matched"], 1);
    }
}
