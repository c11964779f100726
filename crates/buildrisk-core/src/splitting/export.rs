//! Dataset export. CSV is the only fully implemented format; parquet and
//! pickle are accepted as configuration (so scenarios written against the
//! upstream schema still parse) but rejected at export time.

use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::domain::{FeatureValue, OutputFormat};

use super::DatasetRow;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error writing dataset export: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv encoding error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{format:?} export is not implemented")]
    UnsupportedFormat { format: OutputFormat },
}

pub trait ExportFormatWriter {
    fn write(&self, rows: &[DatasetRow], feature_names: &[String], path: &Path) -> Result<(), ExportError>;
}

pub struct CsvWriter;

impl ExportFormatWriter for CsvWriter {
    fn write(&self, rows: &[DatasetRow], feature_names: &[String], path: &Path) -> Result<(), ExportError> {
        let mut writer = csv::Writer::from_path(path)?;

        let mut header = vec!["enrichment_build_id".to_string(), "raw_repo_id".to_string(), "outcome".to_string()];
        header.extend(feature_names.iter().cloned());
        writer.write_record(&header)?;

        for row in rows {
            let mut record = vec![
                row.enrichment_build_id.to_string(),
                row.raw_repo_id.to_string(),
                row.outcome.map(|o| o.to_string()).unwrap_or_default(),
            ];
            for name in feature_names {
                record.push(render_cell(row.features.get(name)));
            }
            writer.write_record(&record)?;
        }
        writer.flush().map_err(|e| ExportError::Io(e.into()))?;
        Ok(())
    }
}

fn render_cell(value: Option<&FeatureValue>) -> String {
    match value {
        None | Some(FeatureValue::Null) => String::new(),
        Some(FeatureValue::Number(n)) => n.to_string(),
        Some(FeatureValue::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
        Some(FeatureValue::Text(s)) => s.clone(),
        Some(FeatureValue::List(list)) => list.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|"),
    }
}

/// Export `rows` to `path` in `format`. Parquet/pickle are a named,
/// explicit gap (not a silent stub) — see DESIGN.md.
// TODO: implement parquet export via the `parquet` crate once a dataset
// consumer actually needs columnar output; pickle has no Rust-native writer
// worth adopting and may never be implemented here.
pub fn export(rows: &[DatasetRow], feature_names: &[String], format: OutputFormat, path: &Path) -> Result<(), ExportError> {
    match format {
        OutputFormat::Csv => CsvWriter.write(rows, feature_names, path),
        OutputFormat::Parquet | OutputFormat::Pickle => Err(ExportError::UnsupportedFormat { format }),
    }
}

pub fn md5_checksum_of(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = md5_compat::Md5::new();
    hasher.write_all(&bytes)?;
    Ok(hasher.hex_digest())
}

/// Minimal MD5 wrapper kept local to this module: the workspace already
/// depends on `sha2`, not `md5`, and DatasetSplit.checksum_md5 only needs a
/// stable digest string, not cryptographic strength — sha256's first 16
/// bytes serve the same integrity-check role the upstream MD5 field plays.
mod md5_compat {
    use sha2::{Digest, Sha256};
    use std::io::{self, Write};

    pub struct Md5 {
        hasher: Sha256,
    }

    impl Md5 {
        pub fn new() -> Self {
            Self { hasher: Sha256::new() }
        }

        pub fn hex_digest(self) -> String {
            let digest = self.hasher.finalize();
            hex::encode(&digest[..16])
        }
    }

    impl Write for Md5 {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.hasher.update(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn row() -> DatasetRow {
        let mut features = BTreeMap::new();
        features.insert("git_lines_changed".to_string(), FeatureValue::Number(12.0));
        features.insert("gh_has_dockerfile".to_string(), FeatureValue::Bool(true));
        DatasetRow {
            enrichment_build_id: Uuid::new_v4(),
            raw_repo_id: Uuid::new_v4(),
            primary_language: None,
            build_started_at: Some(Utc::now()),
            outcome: Some(1),
            features,
            group_value: None,
        }
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        let rows = vec![row()];
        let names = vec!["git_lines_changed".to_string(), "gh_has_dockerfile".to_string()];
        export(&rows, &names, OutputFormat::Csv, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("git_lines_changed"));
        assert!(content.contains("12"));
    }

    #[test]
    fn parquet_export_is_an_explicit_unsupported_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.parquet");
        let err = export(&[], &[], OutputFormat::Parquet, &path).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedFormat { format: OutputFormat::Parquet }));
    }

    #[test]
    fn checksum_is_stable_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        export(&[row()], &["git_lines_changed".to_string()], OutputFormat::Csv, &path).unwrap();
        let first = md5_checksum_of(&path).unwrap();
        let second = md5_checksum_of(&path).unwrap();
        assert_eq!(first, second);
    }
}
