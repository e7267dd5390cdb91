#[cfg(feature = "cli")]
pub mod cli;
pub mod job_config;

#[cfg(feature = "cli")]
pub use cli::CliConfig;
pub use job_config::JobConfig;
