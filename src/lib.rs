pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::JobConfig;

pub use core::{etl::EtlEngine, pipeline::ExtractionPipeline, writer::CsvFileSink};
pub use utils::error::{EtlError, Result};
