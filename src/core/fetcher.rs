use crate::core::collector::CancelFlag;
use crate::core::flatten::{flatten_with, FlattenOptions};
use crate::core::{FetchOutcome, FlatRecord, PageResult, PageSource, ResultSet};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::future::Future;

pub const DEFAULT_PAGE_SIZE: usize = 200;

/// 分頁抓取的狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Start,
    Awaiting { offset: usize },
    Done,
    Failed { offset: usize },
}

/// 重複呼叫 offset/limit 端點直到資料耗盡
///
/// 終止條件依序為：空頁、短頁（筆數少於 `page_size`）、已達宣告的總數、
/// 或達到 `max_records` 上限。API 未提供總數時只能靠短頁判斷，屬於盡力而為。
#[derive(Debug, Clone)]
pub struct PaginatedFetcher {
    page_size: usize,
    max_records: Option<usize>,
    flatten: FlattenOptions,
    cancel: CancelFlag,
}

impl PaginatedFetcher {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            max_records: None,
            flatten: FlattenOptions::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn with_flatten_options(mut self, options: FlattenOptions) -> Self {
        self.flatten = options;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// 依 offset 遞增順序抓取每一頁
    ///
    /// 失敗不會以 `Err` 回傳，而是以 [`FetchOutcome::Failed`] 結束並保留先前已接受的記錄。
    pub async fn fetch_all<S: PageSource + ?Sized>(&self, source: &S) -> ResultSet {
        let mut records: Vec<FlatRecord> = Vec::new();
        let mut requests = 0usize;
        let mut state = FetchState::Start;
        let mut failure: Option<EtlError> = None;

        loop {
            let offset = match state {
                FetchState::Start => 0,
                FetchState::Awaiting { offset } => offset,
                FetchState::Done | FetchState::Failed { .. } => break,
            };

            if self.cancel.is_cancelled() {
                failure = Some(EtlError::Cancelled {
                    context: format!("{} at offset {}", source.name(), offset),
                });
                state = FetchState::Failed { offset };
                continue;
            }

            tracing::debug!(
                "📡 {}: requesting offset={} limit={}",
                source.name(),
                offset,
                self.page_size
            );
            requests += 1;

            let page = match source.fetch_page(offset, self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ {}: page at offset {} failed: {}",
                        source.name(),
                        offset,
                        e
                    );
                    failure = Some(e);
                    state = FetchState::Failed { offset };
                    continue;
                }
            };

            let flattened = match self.flatten_page(&page) {
                Ok(flattened) => flattened,
                Err(e) => {
                    tracing::warn!("⚠️ {}: could not flatten page at offset {}: {}", source.name(), offset, e);
                    failure = Some(e);
                    state = FetchState::Failed { offset };
                    continue;
                }
            };
            records.extend(flattened);

            state = self.next_state(offset, &page);
            if let Some(max) = self.max_records {
                if records.len() >= max {
                    records.truncate(max);
                    tracing::info!(
                        "✂️ {}: reached max_records={}, stopping",
                        source.name(),
                        max
                    );
                    state = FetchState::Done;
                }
            }
        }

        let outcome = match (state, failure) {
            (FetchState::Failed { offset }, Some(error)) => FetchOutcome::Failed {
                offset,
                error: EtlError::PageFailed {
                    source_name: source.name().to_string(),
                    offset,
                    source: Box::new(error),
                },
            },
            _ => FetchOutcome::Done,
        };

        match &outcome {
            FetchOutcome::Done => tracing::info!(
                "📥 {}: fetched {} records in {} requests",
                source.name(),
                records.len(),
                requests
            ),
            FetchOutcome::Failed { offset, .. } => tracing::warn!(
                "⚠️ {}: fetch stopped at offset {} with {} partial records",
                source.name(),
                offset,
                records.len()
            ),
        }

        ResultSet {
            source_name: source.name().to_string(),
            records,
            requests,
            outcome,
        }
    }

    fn flatten_page(&self, page: &PageResult) -> Result<Vec<FlatRecord>> {
        page.records
            .iter()
            .map(|record| flatten_with(record, "", &self.flatten))
            .collect()
    }

    fn next_state(&self, offset: usize, page: &PageResult) -> FetchState {
        let returned = page.returned;

        if returned == 0 || returned < self.page_size {
            return FetchState::Done;
        }

        let reached = offset + returned;
        if let Some(total) = page.total_count {
            if reached as u64 >= total {
                return FetchState::Done;
            }
        }

        // 伺服器回傳超過 limit 時，以實際筆數前進避免重複
        FetchState::Awaiting {
            offset: offset + returned.max(self.page_size),
        }
    }
}

/// 以 closure 作為分頁來源：`request(offset, limit)`
pub struct FnPageSource<F> {
    name: String,
    request: F,
}

impl<F> FnPageSource<F> {
    pub fn new(name: impl Into<String>, request: F) -> Self {
        Self {
            name: name.into(),
            request,
        }
    }
}

#[async_trait]
impl<F, Fut> PageSource for FnPageSource<F>
where
    F: Fn(usize, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PageResult>> + Send + 'static,
{
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<PageResult> {
        (self.request)(offset, limit).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn records(range: std::ops::Range<usize>) -> Vec<Record> {
        range
            .map(|i| Record::from_value(json!({"id": i, "project": {"id": i % 3}})).unwrap())
            .collect()
    }

    /// 模擬一個有 `total` 筆資料的端點，並記錄每次請求的 offset
    fn simulated(
        total: usize,
        declare_total: bool,
        offsets: Arc<Mutex<Vec<usize>>>,
    ) -> FnPageSource<impl Fn(usize, usize) -> std::future::Ready<Result<PageResult>> + Send + Sync>
    {
        FnPageSource::new("simulated", move |offset: usize, limit: usize| {
            offsets.lock().unwrap().push(offset);
            let end = (offset + limit).min(total);
            let page = records(offset.min(total)..end);
            let declared = declare_total.then_some(total as u64);
            std::future::ready(Ok(PageResult::new(page, declared)))
        })
    }

    #[tokio::test]
    async fn test_total_count_250_issues_three_requests() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let source = simulated(250, true, offsets.clone());

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert!(result.is_complete());
        assert_eq!(result.requests, 3);
        assert_eq!(result.len(), 250);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 100, 200]);
        assert_eq!(result.records[0].get("project_id"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_short_page_without_total_stops_after_one_request() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let source = simulated(40, false, offsets.clone());

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert!(result.is_complete());
        assert_eq!(result.requests, 1);
        assert_eq!(result.len(), 40);
    }

    #[tokio::test]
    async fn test_exact_multiple_without_total_needs_trailing_empty_page() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let source = simulated(200, false, offsets.clone());

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert!(result.is_complete());
        assert_eq!(*offsets.lock().unwrap(), vec![0, 100, 200]);
        assert_eq!(result.len(), 200);
    }

    #[tokio::test]
    async fn test_exact_multiple_with_total_stops_without_extra_request() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let source = simulated(200, true, offsets.clone());

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert_eq!(result.requests, 2);
        assert_eq!(result.len(), 200);
    }

    #[tokio::test]
    async fn test_empty_first_page_is_done() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let source = simulated(0, true, offsets.clone());

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert!(result.is_complete());
        assert!(result.is_empty());
        assert_eq!(result.requests, 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_records() {
        let source = FnPageSource::new("flaky", |offset: usize, limit: usize| async move {
            if offset >= 200 {
                return Err(EtlError::HttpStatus {
                    url: "https://api.example.com/issues".to_string(),
                    status: 502,
                });
            }
            Ok(PageResult::new(records(offset..offset + limit), Some(1000)))
        });

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert!(!result.is_complete());
        assert_eq!(result.requests, 3);
        assert_eq!(result.len(), 200);
        match &result.outcome {
            FetchOutcome::Failed { offset, error } => {
                assert_eq!(*offset, 200);
                assert!(error.to_string().contains("flaky"));
                assert!(error.to_string().contains("offset 200"));
            }
            FetchOutcome::Done => panic!("expected failure"),
        }
        assert!(result.into_result().is_err());
    }

    #[tokio::test]
    async fn test_max_records_caps_endless_source() {
        let source = FnPageSource::new("endless", |offset: usize, limit: usize| async move {
            Ok(PageResult::new(records(offset..offset + limit), None))
        });

        let result = PaginatedFetcher::new(50)
            .with_max_records(Some(120))
            .fetch_all(&source)
            .await;

        assert!(result.is_complete());
        assert_eq!(result.requests, 3);
        assert_eq!(result.len(), 120);
    }

    #[tokio::test]
    async fn test_oversized_page_advances_by_returned_count() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let seen = offsets.clone();
        let source = FnPageSource::new("greedy", move |offset: usize, _limit: usize| {
            seen.lock().unwrap().push(offset);
            // 忽略 limit，一次回傳 150 筆
            let page = if offset < 300 {
                records(offset..offset + 150)
            } else {
                Vec::new()
            };
            std::future::ready(Ok(PageResult::new(page, None)))
        });

        let result = PaginatedFetcher::new(100).fetch_all(&source).await;

        assert_eq!(*offsets.lock().unwrap(), vec![0, 150, 300]);
        assert_eq!(result.len(), 300);
    }

    #[tokio::test]
    async fn test_cancelled_flag_stops_before_first_request() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let source = simulated(500, true, offsets.clone());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = PaginatedFetcher::new(100)
            .with_cancel_flag(cancel)
            .fetch_all(&source)
            .await;

        assert!(!result.is_complete());
        assert_eq!(result.requests, 0);
        assert!(offsets.lock().unwrap().is_empty());
    }
}
