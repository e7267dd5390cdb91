use crate::domain::model::{Extraction, PageResult, RunSummary, Schema, TransformResult};
use crate::utils::error::Result;
use async_trait::async_trait;

/// 以 offset/limit 分頁的資料來源，每次呼叫取得一頁
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<PageResult>;

    /// 日誌與錯誤訊息中使用的名稱（端點或 parent key）
    fn name(&self) -> &str;
}

/// 僅能附加寫入的表格輸出端
pub trait TabularSink: Send {
    fn name(&self) -> &str;

    /// 既有內容的表頭；尚無內容時回傳 `None`
    fn read_header(&self) -> Result<Option<Schema>>;

    /// 附加資料列；有提供 `header` 時先寫表頭
    fn append(&mut self, header: Option<&Schema>, rows: &[Vec<String>]) -> Result<usize>;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn extract(&self) -> Result<Extraction>;
    async fn transform(&self, extraction: Extraction) -> Result<TransformResult>;
    async fn load(&self, result: TransformResult) -> Result<RunSummary>;
}
