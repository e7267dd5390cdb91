use anyhow::Context;
use clap::Parser;
use vuln_etl::core::dedupe;
use vuln_etl::core::TabularSink;
use vuln_etl::utils::error::{EtlError, ErrorSeverity};
use vuln_etl::utils::{logger, validation::Validate};
use vuln_etl::{CliConfig, CsvFileSink, EtlEngine, ExtractionPipeline, JobConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliConfig::parse();

    // 初始化日誌
    if args.log_json {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🚀 Starting vuln-etl");
    tracing::info!("📁 Loading configuration from: {}", args.config);

    let mut config = match JobConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 應用命令列覆蓋設定
    if let Some(output) = &args.output {
        tracing::info!("🔧 Output path overridden to: {}", output);
        config.load.output_path = output.clone();
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    display_config_summary(&config, &args);

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - no requests will be sent");
        perform_dry_run(&config);
        return Ok(());
    }

    let monitor_enabled = args.monitor.unwrap_or_else(|| config.monitoring_enabled());
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let dedupe_column = config.load.dedupe_column.clone();
    let output_path = config.output_path().to_string();
    let sink = CsvFileSink::new(&output_path);
    let pipeline = match ExtractionPipeline::new(config, sink) {
        Ok(pipeline) => pipeline,
        Err(e) => fail(e),
    };

    // Ctrl-C 時停止派送新的 parent 與後續分頁，已取得的資料照常寫出
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, finishing in-flight requests");
            cancel.cancel();
        }
    });

    let engine = EtlEngine::new_with_monitoring(pipeline, monitor_enabled);
    let summary = match engine.run().await {
        Ok(summary) => summary,
        Err(e) => fail(e),
    };

    println!("✅ Extraction completed");
    println!(
        "📁 {}: {} rows written ({} columns)",
        summary.sink,
        summary.rows_written,
        summary.schema.len()
    );
    if !summary.failures.is_empty() {
        println!(
            "⚠️ {} of {} parents failed:",
            summary.failures.len(),
            summary.parents_total
        );
        for failure in &summary.failures {
            println!("   {}: {}", failure.parent_key, failure.message);
        }
    }

    if let Some(column) = dedupe_column {
        if summary.rows_written > 0 {
            let report = dedupe::dedupe_csv(&output_path, &column)
                .with_context(|| format!("deduplicating {} on '{}'", output_path, column))?;
            println!(
                "🧹 Removed {} duplicate rows on '{}'",
                report.removed(),
                column
            );
        }
    }

    Ok(())
}

fn fail(e: EtlError) -> ! {
    tracing::error!(
        "❌ Extraction failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    // 傳輸錯誤 2，表頭或寫入錯誤 3，其餘 1
    let exit_code = match e.severity() {
        ErrorSeverity::Low | ErrorSeverity::High => 1,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::Critical => 3,
    };
    std::process::exit(exit_code);
}

fn display_config_summary(config: &JobConfig, args: &CliConfig) {
    println!("📋 Configuration Summary:");
    println!("  Job: {}", config.job.name);
    if let Some(description) = &config.job.description {
        println!("  Description: {}", description);
    }
    println!("  Source: {}", config.source.endpoint);
    println!("  Output: {}", config.output_path());
    println!("  Page Size: {}", config.source.page_size());
    println!(
        "  Concurrent Requests: {}",
        config.extract.concurrent_requests()
    );
    if let Some(max_records) = config.extract.max_records {
        println!("  Max Records: {}", max_records);
    }
    if args.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }
    println!();
}

fn perform_dry_run(config: &JobConfig) {
    println!("🔍 Dry Run Analysis:");
    println!();

    println!("📡 Data Source:");
    println!("  Endpoint: {}", config.source.endpoint);
    if let Some(headers) = &config.source.headers {
        println!("  Headers: {} custom headers", headers.len());
    }
    for (key, value) in config.source.base_query() {
        println!("  Query: {}={}", key, value);
    }
    println!(
        "  Paging: {}=<offset> {}={}",
        config.source.offset_param(),
        config.source.limit_param(),
        config.source.page_size()
    );

    println!();
    println!("🔗 Parents:");
    match &config.parents {
        None => println!("  Single fetch (no parent keys)"),
        Some(parents) => {
            if let Some(keys) = &parents.keys {
                println!("  {} literal keys: {}", keys.len(), keys.join(", "));
            }
            if let Some(source) = &parents.source {
                println!(
                    "  Discovered from {} (field '{}')",
                    source.endpoint,
                    parents.id_field()
                );
            }
            if let Some(column) = &config.extract.parent_key_column {
                println!("  Parent key stamped into column '{}'", column);
            }
            if !config.extract.parent_columns().is_empty() {
                println!(
                    "  Parent columns carried as '{}<column>': {}",
                    config.extract.parent_column_prefix(),
                    config.extract.parent_columns().join(", ")
                );
            }
            if let Some(path) = &parents.output_path {
                println!("  Parent records written to {}", path);
            }
        }
    }

    println!();
    println!("🔄 Flattening:");
    let flatten = config.flatten.options();
    println!("  Separator: '{}'", flatten.separator);
    println!("  Max Depth: {}", flatten.max_depth);
    println!("  Lists of Objects: {:?}", flatten.list_of_objects);

    println!();
    println!("💾 Output:");
    println!("  Path: {}", config.output_path());
    match &config.load.columns {
        Some(columns) => {
            println!("  Columns ({}):", columns.len());
            for column in columns {
                println!("    {} -> {}", column.source, column.output_name());
            }
        }
        None => println!("  Columns: inferred from records"),
    }
    let sink = CsvFileSink::new(config.output_path());
    match sink.read_header() {
        Ok(Some(header)) => println!("  Existing header: {}", header.fields().join(", ")),
        Ok(None) => println!("  New file (header will be written)"),
        Err(e) => println!("  ⚠️ Cannot read existing file: {}", e),
    }
    if let Some(column) = &config.load.dedupe_column {
        println!("  Dedupe on: {}", column);
    }

    println!();
    println!("✅ Dry run completed - configuration looks valid");
}
