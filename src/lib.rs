pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod structs;
pub mod transform;

// Re-export public API
pub use error::{PipelineError, Result, Stage};
pub use extract::{csv_records, open_records};
pub use load::{BulkLoader, DuplicateSink, SqliteLoader, write_report};
pub use pipeline::{run, run_with};
pub use structs::{InputFormat, PipelineConfig, RunReport, SimpleLogger, TripKey, TripRecord};
pub use transform::{resolve_timezone, transform};
