//! 執行後的 CSV 去重
//!
//! 附加寫入不會去重，重複執行會累積重複的資料列。這裡重寫整個檔案，
//! 每個唯一欄位值只保留最後一列；先寫到同目錄的暫存檔，完成後才取代原檔。

use crate::utils::error::{EtlError, Result};
use std::collections::HashMap;
use std::io::BufWriter;
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeReport {
    pub rows_before: usize,
    pub rows_after: usize,
}

impl DedupeReport {
    pub fn removed(&self) -> usize {
        self.rows_before - self.rows_after
    }
}

pub fn dedupe_csv(path: impl AsRef<Path>, unique_column: &str) -> Result<DedupeReport> {
    let path = path.as_ref();

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = headers
        .iter()
        .position(|h| h == unique_column)
        .ok_or_else(|| EtlError::ValidationError {
            message: format!(
                "Column '{}' does not exist in {} (columns: {})",
                unique_column,
                path.display(),
                headers.iter().collect::<Vec<_>>().join(", ")
            ),
        })?;

    let rows = reader
        .records()
        .collect::<std::result::Result<Vec<_>, csv::Error>>()?;

    let mut last_seen: HashMap<String, usize> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        last_seen.insert(row.get(column).unwrap_or_default().to_string(), index);
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(parent)?;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(BufWriter::new(temp));
    writer.write_record(&headers)?;

    let mut kept = 0usize;
    for (index, row) in rows.iter().enumerate() {
        if last_seen.get(row.get(column).unwrap_or_default()) == Some(&index) {
            writer.write_record(row)?;
            kept += 1;
        }
    }

    let buffered = writer.into_inner().map_err(|e| {
        EtlError::IoError(std::io::Error::new(e.error().kind(), e.error().to_string()))
    })?;
    let temp = buffered
        .into_inner()
        .map_err(|e| EtlError::IoError(e.into_error()))?;
    temp.persist(path).map_err(|e| EtlError::IoError(e.error))?;

    let report = DedupeReport {
        rows_before: rows.len(),
        rows_after: kept,
    };
    tracing::info!(
        "🧹 {}: removed {} duplicate rows on '{}' ({} -> {})",
        path.display(),
        report.removed(),
        unique_column,
        report.rows_before,
        report.rows_after
    );
    Ok(report)
}
