use crate::error::{Result, Stage};
use crate::extract::open_records;
use crate::load::{BulkLoader, DuplicateSink, SqliteLoader, TABLE, write_report};
use crate::structs::{PipelineConfig, RunReport};
use crate::transform::{TransformOutput, resolve_timezone, transform};
use chrono_tz::Tz;
use log::{debug, warn};
use std::{collections::HashSet, time::Instant};

/// Runs one import against the SQLite database named in `config`.
///
/// # Arguments
/// * `config` - Input, duplicates and database paths plus the source time zone
///
/// # Returns
/// Returns the `RunReport` of a completed import.
///
/// # Errors
/// Same as `run_with`; the database is opened only after the input has been read.
pub fn run(config: &PipelineConfig) -> Result<RunReport> {
    run_with(config, || SqliteLoader::open(&config.database))
}

/// Runs read/transform, bulk load and verification in sequence.
///
/// The destination is only opened, through `open_loader`, once the input has
/// been fully read and the duplicates file closed. Any stage failure aborts
/// the run; in particular a failed load skips verification. A verified row
/// count that differs from the accepted count is logged as a warning.
///
/// # Arguments
/// * `config` - Run configuration
/// * `open_loader` - Opens the destination table
///
/// # Returns
/// Returns a `RunReport` with row counts from every stage. If `config.report`
/// is set the report is also written there as JSON; failing to write it only
/// logs a warning.
///
/// # Errors
/// Returns `PipelineError::Stage` naming the stage that failed: `Transform`
/// for time zone, input and duplicates file errors, `Load` for opening or
/// filling the destination, `Verify` for the count query.
pub fn run_with<L, F>(config: &PipelineConfig, open_loader: F) -> Result<RunReport>
where
    L: BulkLoader,
    F: FnOnce() -> Result<L>,
{
    let started = Instant::now();
    let format = config.input_format();

    let zone = resolve_timezone(&config.timezone, &config.timezone_fallback)
        .map_err(|e| e.in_stage(Stage::Transform))?;
    debug!("Source time zone: {}", zone.name());

    println!("Reading and transforming data...");
    let transform_start = Instant::now();
    let output =
        read_and_transform(config, zone).map_err(|e| e.in_stage(Stage::Transform))?;
    println!(
        "Data preparation finished in {:.2?}. Valid records: {}. Inserting into DB...",
        transform_start.elapsed(),
        output.accepted.len()
    );

    let load_start = Instant::now();
    let mut loader = open_loader().map_err(|e| e.in_stage(Stage::Load))?;
    let rows_written = loader
        .load(&output.accepted)
        .map_err(|e| e.in_stage(Stage::Load))?;
    println!(
        "Bulk insert completed successfully! {} rows in {:.2?}",
        rows_written,
        load_start.elapsed()
    );

    let table_row_count = loader
        .row_count()
        .map_err(|e| e.in_stage(Stage::Verify))?;
    println!(
        "[SUCCESS] Total rows in '{}' table after execution: {}",
        TABLE, table_row_count
    );
    if table_row_count != output.accepted.len() as u64 {
        warn!(
            "Table holds {} rows but {} records were accepted",
            table_row_count,
            output.accepted.len()
        );
    }

    let report = RunReport {
        input: config.input.clone(),
        format,
        timezone: zone.name().to_string(),
        total_rows: output.total_rows,
        accepted: output.accepted.len(),
        duplicates: output.duplicates,
        rows_written,
        table_row_count,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };

    // The import has already been committed, so a lost report is not fatal
    if let Some(path) = &config.report {
        match write_report(&report, path) {
            Ok(()) => debug!("Run report written to {}", path.display()),
            Err(e) => warn!("Could not write run report to {}: {}", path.display(), e),
        }
    }

    Ok(report)
}

/// Streams the input through the transformer, writing duplicates as it goes.
/// Both files are closed before this returns.
fn read_and_transform(config: &PipelineConfig, zone: Tz) -> Result<TransformOutput> {
    let records = open_records(&config.input, config.input_format())?;
    let mut duplicates = DuplicateSink::create(&config.duplicates)?;
    let mut seen = HashSet::new();

    let output = transform(records, &mut seen, &mut duplicates, zone)?;
    duplicates.finish()?;
    debug!(
        "{} distinct trip keys, {} duplicates written to {}",
        seen.len(),
        output.duplicates,
        config.duplicates.display()
    );
    Ok(output)
}
