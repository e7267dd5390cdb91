use crate::config::job_config::EndpointConfig;
use crate::core::{PageResult, PageSource, Record};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// 未指定 `records_key` 時依序嘗試的欄位
pub const RECORD_KEYS: [&str; 3] = ["items", "data", "results"];
/// 未指定 `total_key` 時依序嘗試的欄位
pub const TOTAL_KEYS: [&str; 3] = ["count", "totalItems", "totalRecords"];

pub const PARENT_KEY_PLACEHOLDER: &str = "{parent_key}";

/// 透過 HTTP GET 取得分頁資料；認證標頭由設定檔提供，這裡只當作不透明的標頭
pub struct HttpPageSource {
    client: Client,
    endpoint: Arc<EndpointConfig>,
    url: String,
    base_query: Vec<(String, String)>,
}

impl HttpPageSource {
    pub fn new(client: Client, endpoint: Arc<EndpointConfig>) -> Self {
        let url = endpoint.endpoint.clone();
        Self::with_url(client, endpoint, url)
    }

    /// 單一 parent 的資料來源；端點中的 `{parent_key}` 以編碼後的 key 取代
    pub fn for_parent(client: Client, endpoint: Arc<EndpointConfig>, parent_key: &str) -> Self {
        let encoded: String = url::form_urlencoded::byte_serialize(parent_key.as_bytes()).collect();
        let url = endpoint.endpoint.replace(PARENT_KEY_PLACEHOLDER, &encoded);
        Self::with_url(client, endpoint, url)
    }

    fn with_url(client: Client, endpoint: Arc<EndpointConfig>, url: String) -> Self {
        let base_query = endpoint.base_query();
        Self {
            client,
            endpoint,
            url,
            base_query,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 依端點設定建立 HTTP client
    pub fn build_client(endpoint: &EndpointConfig) -> Result<Client> {
        let mut builder = Client::builder().timeout(Duration::from_secs(endpoint.timeout_seconds()));
        if !endpoint.verify_tls() {
            tracing::warn!(
                "🔓 TLS certificate verification disabled for {}",
                endpoint.endpoint
            );
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<PageResult> {
        let mut request = self.client.get(&self.url);

        if let Some(headers) = &self.endpoint.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let mut query = self.base_query.clone();
        query.push((self.endpoint.offset_param().to_string(), offset.to_string()));
        query.push((self.endpoint.limit_param().to_string(), limit.to_string()));

        let response = request
            .query(&query)
            .timeout(Duration::from_secs(self.endpoint.timeout_seconds()))
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("📡 {}: response status {}", self.url, status);
        if !status.is_success() {
            return Err(EtlError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let json: Value = serde_json::from_str(&body).map_err(|e| EtlError::DecodeError {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        decode_page(
            json,
            self.endpoint.records_key.as_deref(),
            self.endpoint.total_key.as_deref(),
        )
        .map_err(|message| EtlError::DecodeError {
            url: self.url.clone(),
            message,
        })
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// 從回應內容取出記錄陣列與宣告總數
///
/// 頂層是陣列時直接視為記錄；是物件時讀取 `records_key`（或 items/data/results）。
/// 非物件的元素仍計入本頁筆數，但不會成為記錄。
pub fn decode_page(
    body: Value,
    records_key: Option<&str>,
    total_key: Option<&str>,
) -> std::result::Result<PageResult, String> {
    let (items, total_count) = match body {
        Value::Array(items) => (items, None),
        Value::Object(mut object) => {
            let total_count = read_total(&object, total_key);
            let items = take_records(&mut object, records_key)?;
            (items, total_count)
        }
        other => {
            return Err(format!(
                "expected a JSON object or array, got {}",
                json_kind(&other)
            ))
        }
    };

    let returned = items.len();
    let records: Vec<Record> = items.into_iter().filter_map(Record::from_value).collect();
    if records.len() < returned {
        tracing::debug!(
            "Skipped {} non-object entries in page",
            returned - records.len()
        );
    }

    Ok(PageResult {
        records,
        returned,
        total_count: total_count.filter(|total| *total > 0),
    })
}

fn take_records(
    object: &mut Map<String, Value>,
    records_key: Option<&str>,
) -> std::result::Result<Vec<Value>, String> {
    let candidates: Vec<&str> = match records_key {
        Some(key) => vec![key],
        None => RECORD_KEYS.to_vec(),
    };

    for key in &candidates {
        match object.remove(*key) {
            Some(Value::Array(items)) => return Ok(items),
            Some(Value::Null) => return Ok(Vec::new()),
            Some(other) if records_key.is_some() => {
                return Err(format!(
                    "'{}' is {}, expected an array",
                    key,
                    json_kind(&other)
                ))
            }
            _ => {}
        }
    }

    Err(format!(
        "no records array found (tried {})",
        candidates.join(", ")
    ))
}

fn read_total(object: &Map<String, Value>, total_key: Option<&str>) -> Option<u64> {
    let candidates: Vec<&str> = match total_key {
        Some(key) => vec![key],
        None => TOTAL_KEYS.to_vec(),
    };

    candidates.iter().find_map(|key| match object.get(*key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
