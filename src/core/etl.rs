use crate::core::{Pipeline, RunSummary};
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;

pub struct EtlEngine<P: Pipeline> {
    pipeline: P,
    monitor: SystemMonitor,
}

impl<P: Pipeline> EtlEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self::new_with_monitoring(pipeline, false)
    }

    pub fn new_with_monitoring(pipeline: P, monitor_enabled: bool) -> Self {
        Self {
            pipeline,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> P {
        self.pipeline
    }

    /// 依序執行 extract -> transform -> load
    ///
    /// 個別 parent 失敗不會讓整體失敗，會留在 [`RunSummary::failures`]；
    /// 表頭不符或寫入失敗則直接回傳錯誤。
    pub async fn run(&self) -> Result<RunSummary> {
        tracing::info!("🚀 Starting extraction run");
        self.monitor.log_stats("Start");

        tracing::info!("📥 Extracting records...");
        let extraction = self.pipeline.extract().await?;
        self.monitor.log_stats("Extract");

        tracing::info!("🔄 Building output rows...");
        let transformed = self.pipeline.transform(extraction).await?;
        self.monitor.log_stats("Transform");

        tracing::info!("💾 Writing rows...");
        let summary = self.pipeline.load(transformed).await?;
        self.monitor.log_stats("Load");

        if summary.failures.is_empty() {
            tracing::info!(
                "✅ {}: wrote {} rows from {} parents",
                summary.sink,
                summary.rows_written,
                summary.parents_total
            );
        } else {
            tracing::warn!(
                "⚠️ {}: wrote {} rows; {} of {} parents failed",
                summary.sink,
                summary.rows_written,
                summary.failures.len(),
                summary.parents_total
            );
            for failure in &summary.failures {
                tracing::warn!("   ↳ {}: {}", failure.parent_key, failure.message);
            }
        }

        self.monitor.log_final_stats();
        Ok(summary)
    }
}
