use crate::config::job_config::{ColumnMapping, EndpointConfig, JobConfig};
use crate::core::collector::{CancelFlag, ConcurrentCollector};
use crate::core::fetcher::PaginatedFetcher;
use crate::core::http_source::HttpPageSource;
use crate::core::writer::CsvFileSink;
use crate::core::{
    schema, writer, Extraction, FetchOutcome, FlatRecord, ParentFailure, Pipeline, RunSummary,
    Schema, TabularSink, TransformResult,
};
use crate::utils::error::{EtlError, Result};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// parent keys（依提交順序）與探索到的 parent 記錄
#[derive(Debug, Clone, Default)]
pub struct ParentSet {
    pub keys: Vec<String>,
    pub records: HashMap<String, FlatRecord>,
}

/// 依工作設定執行：解析 parent keys -> 並行分頁抓取 -> 決定表頭 -> 比對 -> 附加寫入
pub struct ExtractionPipeline<S: TabularSink> {
    config: Arc<JobConfig>,
    client: Client,
    sink: Mutex<S>,
    cancel: CancelFlag,
}

impl<S: TabularSink> ExtractionPipeline<S> {
    pub fn new(config: JobConfig, sink: S) -> Result<Self> {
        let client = HttpPageSource::build_client(&config.source)?;
        Ok(Self {
            config: Arc::new(config),
            client,
            sink: Mutex::new(sink),
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn into_sink(self) -> S {
        self.sink.into_inner()
    }

    fn fetcher(&self, endpoint: &EndpointConfig, max_records: Option<usize>) -> PaginatedFetcher {
        PaginatedFetcher::new(endpoint.page_size())
            .with_max_records(max_records)
            .with_flatten_options(self.config.flatten.options())
            .with_cancel_flag(self.cancel.clone())
    }

    /// 取得 parent keys；沒有設定 `[parents]` 時回傳 `None`
    ///
    /// 從端點探索時一併保留每個 parent 的展平記錄，設定 `parents.output_path`
    /// 時另存成 CSV。
    pub async fn resolve_parents(&self) -> Result<Option<ParentSet>> {
        let Some(parents) = &self.config.parents else {
            return Ok(None);
        };

        if let Some(keys) = &parents.keys {
            return Ok(Some(ParentSet {
                keys: unique_in_order(keys.iter().cloned()),
                records: HashMap::new(),
            }));
        }

        let source_config = parents
            .source
            .as_ref()
            .ok_or_else(|| EtlError::MissingConfigError {
                field: "parents.keys or parents.source".to_string(),
            })?;

        let client = HttpPageSource::build_client(source_config)?;
        let source = HttpPageSource::new(client, Arc::new(source_config.clone()));
        tracing::info!("🔎 Discovering parent keys from {}", source.url());

        // parent 清單抓取失敗時整個工作無法繼續
        let parents_found = self
            .fetcher(source_config, None)
            .fetch_all(&source)
            .await
            .into_result()?;

        if let Some(path) = &parents.output_path {
            write_parents(path, &parents_found)?;
        }

        let id_field = parents.id_field();
        let found = parents_found.len();
        let mut records = HashMap::new();
        let keys = unique_in_order(parents_found.into_iter().filter_map(|record| {
            let key = record.get(id_field).and_then(key_text)?;
            records.entry(key.clone()).or_insert(record);
            Some(key)
        }));
        let skipped = found.saturating_sub(keys.len());
        if skipped > 0 {
            tracing::debug!(
                "Skipped {} parent records without a usable or unique '{}'",
                skipped,
                id_field
            );
        }

        tracing::info!("🔎 Found {} parent keys", keys.len());
        Ok(Some(ParentSet { keys, records }))
    }

    async fn extract_single(&self, endpoint: Arc<EndpointConfig>) -> Extraction {
        let source = HttpPageSource::new(self.client.clone(), Arc::clone(&endpoint));
        let result_set = self
            .fetcher(&endpoint, self.config.extract.max_records)
            .fetch_all(&source)
            .await;

        let mut extraction = Extraction {
            parents_total: 1,
            ..Extraction::default()
        };
        match result_set.outcome {
            FetchOutcome::Done => extraction.records = result_set.records,
            FetchOutcome::Failed { error, .. } => {
                extraction.failures.push(ParentFailure {
                    parent_key: result_set.source_name,
                    message: error.to_string(),
                    partial_records: result_set.records.len(),
                });
                if self.config.extract.keep_partial() {
                    extraction.records = result_set.records;
                }
            }
        }
        extraction
    }

    async fn extract_per_parent(&self, endpoint: Arc<EndpointConfig>, parents: ParentSet) -> Extraction {
        let ParentSet { keys, records } = parents;
        if keys.is_empty() {
            tracing::warn!("⚠️ No parent keys to fetch");
        }

        let collector = ConcurrentCollector::new(self.config.extract.concurrent_requests())
            .with_keep_partial(self.config.extract.keep_partial())
            .with_cancel_flag(self.cancel.clone());
        let fetcher = self.fetcher(&endpoint, self.config.extract.max_records);
        let client = self.client.clone();
        let stamp_column = self.config.extract.parent_key_column.clone();
        let parent_records = Arc::new(records);
        let parent_columns: Arc<Vec<(String, String)>> = Arc::new(
            self.config
                .extract
                .parent_columns()
                .iter()
                .map(|column| {
                    let name = format!("{}{}", self.config.extract.parent_column_prefix(), column);
                    (column.clone(), name)
                })
                .collect(),
        );

        let collection = collector
            .collect_all(keys, move |key: String| {
                let client = client.clone();
                let endpoint = Arc::clone(&endpoint);
                let fetcher = fetcher.clone();
                let stamp_column = stamp_column.clone();
                let parent_records = Arc::clone(&parent_records);
                let parent_columns = Arc::clone(&parent_columns);
                async move {
                    let source = HttpPageSource::for_parent(client, endpoint, &key);
                    let mut result_set = fetcher.fetch_all(&source).await;
                    if let Some(parent) = parent_records.get(&key) {
                        if !parent_columns.is_empty() {
                            for record in &mut result_set.records {
                                carry_parent_fields(record, parent, &parent_columns);
                            }
                        }
                    }
                    if let Some(column) = &stamp_column {
                        for record in &mut result_set.records {
                            stamp_parent(record, column, &key);
                        }
                    }
                    Ok(result_set)
                }
            })
            .await;

        Extraction {
            parents_total: collection.total(),
            records: collection.records,
            failures: collection.failures,
        }
    }
}

#[async_trait::async_trait]
impl<S: TabularSink> Pipeline for ExtractionPipeline<S> {
    async fn extract(&self) -> Result<Extraction> {
        let endpoint = Arc::new(self.config.source.clone());
        let extraction = match self.resolve_parents().await? {
            None => self.extract_single(endpoint).await,
            Some(parents) => self.extract_per_parent(endpoint, parents).await,
        };

        tracing::info!(
            "📥 {}: extracted {} records ({} of {} parents failed)",
            self.config.job.name,
            extraction.records.len(),
            extraction.failures.len(),
            extraction.parents_total
        );
        Ok(extraction)
    }

    async fn transform(&self, extraction: Extraction) -> Result<TransformResult> {
        let (schema, rows) = match &self.config.load.columns {
            Some(columns) => project(columns, extraction.records),
            None => {
                let schema = Schema::infer(&extraction.records);
                (schema, extraction.records)
            }
        };

        tracing::info!(
            "🔄 {}: {} rows across {} columns",
            self.config.job.name,
            rows.len(),
            schema.len()
        );

        Ok(TransformResult {
            schema,
            rows,
            parents_total: extraction.parents_total,
            failures: extraction.failures,
        })
    }

    async fn load(&self, result: TransformResult) -> Result<RunSummary> {
        let mut sink = self.sink.lock().await;

        let mut summary = RunSummary {
            sink: sink.name().to_string(),
            schema: result.schema,
            rows_written: 0,
            parents_total: result.parents_total,
            failures: result.failures,
        };

        if result.rows.is_empty() || summary.schema.is_empty() {
            tracing::warn!("⚠️ {}: no records to write", summary.sink);
            return Ok(summary);
        }

        // 推斷的表頭只差順序時沿用既有檔案的順序
        if self.config.load.columns.is_none() {
            summary.schema = schema::align_inferred(summary.schema, &*sink)?;
        }
        schema::reconcile(&summary.schema, &*sink)?;
        summary.rows_written = writer::write(&result.rows, &summary.schema, &mut *sink)?;
        Ok(summary)
    }
}

/// 依欄位對應挑選並重新命名；表頭即為輸出欄位順序
pub fn project(columns: &[ColumnMapping], records: Vec<FlatRecord>) -> (Schema, Vec<FlatRecord>) {
    let schema = Schema::new(columns.iter().map(|c| c.output_name().to_string()));
    let rows = records
        .into_iter()
        .map(|mut record| {
            let mut projected = FlatRecord::new();
            for column in columns {
                if let Some(value) = record.fields.remove(&column.source) {
                    projected.insert(column.output_name().to_string(), value);
                }
            }
            projected
        })
        .collect();
    (schema, rows)
}

/// 探索到的 parent 記錄寫入自己的 CSV，表頭規則與主要輸出相同
fn write_parents(path: &str, parents: &[FlatRecord]) -> Result<usize> {
    if parents.is_empty() {
        tracing::warn!("⚠️ {}: no parent records to write", path);
        return Ok(0);
    }

    let mut sink = CsvFileSink::new(path);
    let fieldnames = schema::align_inferred(Schema::infer(parents), &sink)?;
    schema::reconcile(&fieldnames, &sink)?;
    writer::write(parents, &fieldnames, &mut sink)
}

/// 把 parent 記錄的指定欄位（`(來源鍵, 輸出名稱)`）放在子記錄前面；parent 沒有的欄位略過
pub fn carry_parent_fields(record: &mut FlatRecord, parent: &FlatRecord, columns: &[(String, String)]) {
    let mut fields = Map::new();
    for (source, name) in columns {
        if let Some(value) = parent.get(source) {
            fields.insert(name.clone(), value.clone());
        }
    }
    for (key, value) in std::mem::take(&mut record.fields) {
        fields.entry(key).or_insert(value);
    }
    record.fields = fields;
}

/// 把 parent key 放在記錄的第一個欄位
pub fn stamp_parent(record: &mut FlatRecord, column: &str, parent_key: &str) {
    let mut fields = Map::new();
    fields.insert(column.to_string(), Value::String(parent_key.to_string()));
    for (key, value) in std::mem::take(&mut record.fields) {
        fields.entry(key).or_insert(value);
    }
    record.fields = fields;
}

fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unique_in_order(keys: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}
