use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "vuln-etl")]
#[command(about = "Paginated API extraction into append-only CSV files")]
pub struct CliConfig {
    /// Path to the TOML job configuration
    #[arg(short, long, default_value = "vuln-etl.toml")]
    pub config: String,

    /// Override load.output_path from the config
    #[arg(short, long)]
    pub output: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Override monitoring setting from config
    #[arg(long)]
    pub monitor: Option<bool>,

    /// Show what would be fetched without calling the API
    #[arg(long)]
    pub dry_run: bool,
}
