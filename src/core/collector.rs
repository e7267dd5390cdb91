use crate::core::{FetchOutcome, FlatRecord, ParentFailure, ResultSet};
use crate::utils::error::{EtlError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// 共用的取消旗標，在分頁之間與派送 parent key 之前檢查
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 合併後的抓取結果；記錄依 parent key 的提交順序排列
#[derive(Debug, Default)]
pub struct Collection {
    pub records: Vec<FlatRecord>,
    pub succeeded: usize,
    pub failures: Vec<ParentFailure>,
}

impl Collection {
    pub fn total(&self) -> usize {
        self.succeeded + self.failures.len()
    }
}

/// 以固定上限的並行度，對每個 parent key 各執行一次抓取
#[derive(Debug, Clone)]
pub struct ConcurrentCollector {
    max_concurrency: usize,
    keep_partial: bool,
    cancel: CancelFlag,
}

impl Default for ConcurrentCollector {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl ConcurrentCollector {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            keep_partial: false,
            cancel: CancelFlag::new(),
        }
    }

    /// 失敗的抓取在中止前取得的記錄也一併合併，而非捨棄
    pub fn with_keep_partial(mut self, keep_partial: bool) -> Self {
        self.keep_partial = keep_partial;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 對每個 parent key 執行 `fetch_one`，全部完成或失敗後才回傳
    ///
    /// 失敗的 key（錯誤、失敗的結果或 panic）會記錄在 [`Collection::failures`]，
    /// 不會中止其他 key。合併後的記錄依 `parent_keys` 的提交順序排列，與完成順序無關。
    pub async fn collect_all<F, Fut>(&self, parent_keys: Vec<String>, fetch_one: F) -> Collection
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResultSet>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let fetch_one = Arc::new(fetch_one);
        let mut join_set = JoinSet::new();

        tracing::info!(
            "🚀 Collecting {} parent keys with up to {} concurrent fetches",
            parent_keys.len(),
            self.max_concurrency
        );

        let mut pending: BTreeMap<usize, String> = BTreeMap::new();
        for (index, parent_key) in parent_keys.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let fetch_one = Arc::clone(&fetch_one);
            let cancel = self.cancel.clone();
            let key = parent_key.clone();
            pending.insert(index, parent_key);

            let task = async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EtlError::ProcessingError {
                        message: format!("worker pool closed: {}", e),
                    })?;
                if cancel.is_cancelled() {
                    return Err(EtlError::Cancelled {
                        context: format!("parent key {} was not dispatched", key),
                    });
                }
                fetch_one(key).await
            };

            // 內層任務 panic 時，外層仍能回報是哪個 parent key
            join_set.spawn(async move {
                let joined = tokio::spawn(task).await;
                (index, joined)
            });
        }

        let mut collection = Collection::default();
        let mut slots: Vec<Vec<FlatRecord>> = vec![Vec::new(); pending.len()];
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("❌ Collector task aborted: {}", e);
                    continue;
                }
            };
            let Some(parent_key) = pending.remove(&index) else {
                continue;
            };

            match outcome {
                Ok(Ok(result_set)) => {
                    self.merge(&mut collection, &mut slots[index], parent_key, result_set)
                }
                Ok(Err(e)) => self.record_failure(&mut collection, parent_key, e.to_string(), 0),
                Err(join_error) => self.record_failure(
                    &mut collection,
                    parent_key,
                    format!("fetch task panicked: {}", join_error),
                    0,
                ),
            }
        }

        self.record_lost(&mut collection, pending);

        collection.records = slots.into_iter().flatten().collect();

        tracing::info!(
            "📦 Collected {} records from {} parent keys ({} failed)",
            collection.records.len(),
            collection.total(),
            collection.failures.len()
        );
        collection
    }

    fn merge(
        &self,
        collection: &mut Collection,
        slot: &mut Vec<FlatRecord>,
        parent_key: String,
        result_set: ResultSet,
    ) {
        match result_set.outcome {
            FetchOutcome::Done => {
                tracing::info!(
                    "✅ Parent {}: {} records",
                    parent_key,
                    result_set.records.len()
                );
                collection.succeeded += 1;
                slot.extend(result_set.records);
            }
            FetchOutcome::Failed { error, .. } => {
                let partial = result_set.records.len();
                if self.keep_partial {
                    slot.extend(result_set.records);
                }
                self.record_failure(collection, parent_key, error.to_string(), partial);
            }
        }
    }

    /// 外層任務本身失敗時拿不到 key，依尚未回報的索引補記為失敗
    fn record_lost(&self, collection: &mut Collection, pending: BTreeMap<usize, String>) {
        for (_, parent_key) in pending {
            self.record_failure(
                collection,
                parent_key,
                "fetch task was lost before reporting a result".to_string(),
                0,
            );
        }
    }

    fn record_failure(
        &self,
        collection: &mut Collection,
        parent_key: String,
        message: String,
        partial_records: usize,
    ) {
        tracing::error!("❌ Parent {}: {}", parent_key, message);
        collection.failures.push(ParentFailure {
            parent_key,
            message,
            partial_records,
        });
    }
}
