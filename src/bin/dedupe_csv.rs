use clap::Parser;
use vuln_etl::core::dedupe;
use vuln_etl::utils::logger;

#[derive(Parser)]
#[command(name = "dedupe_csv")]
#[command(about = "Remove duplicate rows from a CSV file, keeping the last occurrence")]
struct Args {
    /// CSV file to rewrite in place
    #[arg(short, long)]
    file: String,

    /// Column whose value identifies a row (e.g. vulnUUID)
    #[arg(short, long)]
    column: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    match dedupe::dedupe_csv(&args.file, &args.column) {
        Ok(report) => {
            println!(
                "✅ {}: removed {} duplicate rows ({} -> {})",
                args.file,
                report.removed(),
                report.rows_before,
                report.rows_after
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("❌ Deduplication failed: {}", e);
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            std::process::exit(1);
        }
    }
}
