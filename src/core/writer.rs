use crate::core::flatten::scalar_text;
use crate::core::{FlatRecord, Schema, TabularSink};
use crate::utils::error::{EtlError, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// 依照欄位順序輸出一列；缺少的欄位寫入空值
pub fn row_values(record: &FlatRecord, fieldnames: &Schema) -> Vec<String> {
    fieldnames
        .fields()
        .iter()
        .map(|field| record.get(field).map(scalar_text).unwrap_or_default())
        .collect()
}

/// 附加寫入；輸出端沒有內容時先寫表頭
///
/// 表頭只在首次寫入時輸出，之後的呼叫只附加資料列。失敗時已寫出的部分會保留，
/// 不做回滾。
pub fn write<S: TabularSink + ?Sized>(
    records: &[FlatRecord],
    fieldnames: &Schema,
    sink: &mut S,
) -> Result<usize> {
    let wrap = |sink: &S, source: EtlError| EtlError::WriteFailed {
        sink: sink.name().to_string(),
        source: Box::new(source),
    };

    let existing = sink.read_header().map_err(|e| wrap(sink, e))?;
    let header = existing.is_none().then_some(fieldnames);
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| row_values(record, fieldnames))
        .collect();

    let written = sink.append(header, &rows).map_err(|e| wrap(sink, e))?;
    tracing::info!(
        "💾 {}: wrote {} rows{}",
        sink.name(),
        written,
        if header.is_some() { " (with header)" } else { "" }
    );
    Ok(written)
}

/// [`write`] 的布林版本；失敗時記錄日誌
pub fn write_checked<S: TabularSink + ?Sized>(
    records: &[FlatRecord],
    fieldnames: &Schema,
    sink: &mut S,
) -> bool {
    match write(records, fieldnames, sink) {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("❌ {}", e);
            false
        }
    }
}

/// 以逗號分隔、UTF-8 編碼的 CSV 檔案輸出端
#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
    name: String,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TabularSink for CsvFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_header(&self) -> Result<Option<Schema>> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() == 0 => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)?;
        let mut first = csv::StringRecord::new();
        if reader.read_record(&mut first)? {
            Ok(Some(Schema::new(first.iter())))
        } else {
            Ok(None)
        }
    }

    fn append(&mut self, header: Option<&Schema>, rows: &[Vec<String>]) -> Result<usize> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // 既有檔案若缺少結尾換行，先補上再附加
        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(b"\n")?;
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if let Some(header) = header {
            writer.write_record(header.fields())?;
        }
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;

        Ok(rows.len())
    }
}

/// 記憶體內的輸出端，供測試與內嵌使用
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    name: String,
    header: Option<Schema>,
    rows: Vec<Vec<String>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn header(&self) -> Option<&Schema> {
        self.header.as_ref()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }
}

impl TabularSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_header(&self) -> Result<Option<Schema>> {
        Ok(self.header.clone())
    }

    fn append(&mut self, header: Option<&Schema>, rows: &[Vec<String>]) -> Result<usize> {
        if let Some(header) = header {
            self.header = Some(header.clone());
        }
        self.rows.extend(rows.iter().cloned());
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn flat(value: Value) -> FlatRecord {
        match value {
            Value::Object(fields) => FlatRecord { fields },
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_header_written_once_across_calls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.csv");
        let mut sink = CsvFileSink::new(&path);
        let schema = Schema::new(["id", "name"]);

        write(&[flat(json!({"id": 1, "name": "a"}))], &schema, &mut sink).unwrap();
        write(
            &[
                flat(json!({"id": 2, "name": "b"})),
                flat(json!({"id": 3, "name": "c"})),
            ],
            &schema,
            &mut sink,
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "id,name\n1,a\n2,b\n3,c\n");
    }

    #[test]
    fn test_missing_fields_and_nulls_become_empty_cells() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.csv");
        let mut sink = CsvFileSink::new(&path);
        let schema = Schema::new(["id", "severity", "owner"]);

        let written = write(
            &[flat(json!({"id": 7, "owner": null}))],
            &schema,
            &mut sink,
        )
        .unwrap();

        assert_eq!(written, 1);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "id,severity,owner\n7,,\n"
        );
    }

    #[test]
    fn test_embedded_separators_are_quoted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.csv");
        let mut sink = CsvFileSink::new(&path);
        let schema = Schema::new(["name", "tags"]);

        write(
            &[flat(json!({"name": "Portal \"v2\"", "tags": "web, api"}))],
            &schema,
            &mut sink,
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "name,tags\n\"Portal \"\"v2\"\"\",\"web, api\"\n"
        );
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out").join("data.csv");
        let mut sink = CsvFileSink::new(&path);

        assert!(write_checked(&[], &Schema::new(["id"]), &mut sink));
        assert_eq!(fs::read_to_string(&path).unwrap(), "id\n");
    }

    #[test]
    fn test_repairs_missing_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(&path, "id,name\n1,a").unwrap();
        let mut sink = CsvFileSink::new(&path);

        write(
            &[flat(json!({"id": 2, "name": "b"}))],
            &Schema::new(["id", "name"]),
            &mut sink,
        )
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "id,name\n1,a\n2,b\n");
    }

    #[test]
    fn test_io_failure_reports_false() {
        let dir = TempDir::new().unwrap();
        // 目標路徑是一個目錄，開檔必定失敗
        let mut sink = CsvFileSink::new(dir.path());

        assert!(!write_checked(
            &[flat(json!({"id": 1}))],
            &Schema::new(["id"]),
            &mut sink
        ));

        let err = write(&[], &Schema::new(["id"]), &mut sink).unwrap_err();
        assert!(matches!(err, EtlError::WriteFailed { .. }));
    }

    #[test]
    fn test_memory_sink_appends_in_call_order() {
        let mut sink = MemorySink::new("memory");
        let schema = Schema::new(["id"]);

        write(&[flat(json!({"id": 1}))], &schema, &mut sink).unwrap();
        write(&[flat(json!({"id": 2}))], &schema, &mut sink).unwrap();

        assert_eq!(sink.header(), Some(&schema));
        assert_eq!(sink.rows(), &[vec!["1".to_string()], vec!["2".to_string()]]);
    }
}
