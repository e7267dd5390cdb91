pub mod collector;
pub mod dedupe;
pub mod etl;
pub mod fetcher;
pub mod flatten;
pub mod http_source;
pub mod pipeline;
pub mod schema;
pub mod writer;

pub use crate::domain::model::{
    Extraction, FetchOutcome, FlatRecord, PageResult, ParentFailure, Record, ResultSet,
    RunSummary, Schema, TransformResult,
};
pub use crate::domain::ports::{PageSource, Pipeline, TabularSink};
pub use crate::utils::error::Result;
