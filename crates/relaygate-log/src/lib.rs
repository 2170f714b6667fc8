//! Asynchronous, bounded-buffer log pipeline (component C). Persists two
//! events per request — Insert on arrival, Update on completion — without
//! ever blocking the dispatcher's hot path.

pub mod pipeline;
pub mod record;

pub use pipeline::{LogPipeline, LogPipelineConfig, LogSink, LogStats};
pub use record::{InsertRecord, LogEvent, UpdateRecord, join_header_values, truncate_body};
