use crate::core::{Schema, TabularSink};
use crate::utils::error::{EtlError, Result};

/// 比對即將寫入的欄位與輸出端既有表頭；不一致時回報錯誤，從不自動修正
pub fn reconcile<S: TabularSink + ?Sized>(fieldnames: &Schema, sink: &S) -> Result<()> {
    match sink.read_header()? {
        None => {
            tracing::debug!(
                "🧾 {}: no existing header, schema will be established by this write",
                sink.name()
            );
            Ok(())
        }
        Some(existing) if existing == *fieldnames => Ok(()),
        Some(existing) => Err(EtlError::SchemaMismatch {
            sink: sink.name().to_string(),
            expected: existing.fields().to_vec(),
            actual: fieldnames.fields().to_vec(),
        }),
    }
}

/// 推斷出的表頭與既有表頭欄位相同、只差順序時，沿用既有表頭的順序
///
/// 只用於推斷的表頭；明確設定的欄位順序仍交給 [`reconcile`] 嚴格比對。
pub fn align_inferred<S: TabularSink + ?Sized>(inferred: Schema, sink: &S) -> Result<Schema> {
    match sink.read_header()? {
        Some(existing) if existing != inferred && existing.same_fields(&inferred) => {
            tracing::debug!(
                "🧾 {}: reusing existing header order for inferred columns",
                sink.name()
            );
            Ok(existing)
        }
        _ => Ok(inferred),
    }
}

/// [`reconcile`] 的布林版本；拒絕的原因會記錄在日誌
pub fn validate<S: TabularSink + ?Sized>(fieldnames: &Schema, sink: &S) -> bool {
    match reconcile(fieldnames, sink) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("❌ {}", e);
            false
        }
    }
}
