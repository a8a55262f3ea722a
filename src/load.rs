use crate::error::{PipelineError, Result};
use crate::structs::{RunReport, TripRecord};
use chrono::NaiveDateTime;
use csv::Writer;
use log::debug;
use rusqlite::{Connection, params_from_iter, types::Value};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

/// Destination table for accepted trips.
pub const TABLE: &str = "Trips";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source field to destination column, in insert order.
///
/// `column_values` yields the bound values in this same order.
pub const COLUMN_MAPPING: [(&str, &str); 9] = [
    ("pickup_datetime", "tpep_pickup_datetime"),
    ("dropoff_datetime", "tpep_dropoff_datetime"),
    ("passenger_count", "passenger_count"),
    ("trip_distance", "trip_distance"),
    ("store_and_fwd_flag", "store_and_fwd_flag"),
    ("pickup_location_id", "PULocationID"),
    ("dropoff_location_id", "DOLocationID"),
    ("fare_amount", "fare_amount"),
    ("tip_amount", "tip_amount"),
];

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Trips (
    tpep_pickup_datetime  TEXT NOT NULL,
    tpep_dropoff_datetime TEXT NOT NULL,
    passenger_count       INTEGER,
    trip_distance         REAL,
    store_and_fwd_flag    TEXT,
    PULocationID          INTEGER,
    DOLocationID          INTEGER,
    fare_amount           REAL,
    tip_amount            REAL
);
"#;

/// Writes duplicate trips as CSV, header first, in the order they arrive.
///
/// Records are written as read, with their original local timestamps, so the
/// output can be fed back through the CSV reader.
pub struct DuplicateSink<W: Write> {
    writer: Writer<W>,
    written: usize,
}

impl DuplicateSink<BufWriter<File>> {
    /// Creates (or truncates) the duplicates file at `path` and writes its header.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or the header cannot be written.
    pub fn create(path: &Path) -> Result<Self> {
        debug!("Writing duplicates to {}", path.display());
        DuplicateSink::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> DuplicateSink<W> {
    /// Wraps `inner` and writes the header row immediately, so even a run
    /// with no duplicates leaves a header-only file.
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = Writer::from_writer(inner);
        writer.write_record(COLUMN_MAPPING.iter().map(|(_, column)| *column))?;
        Ok(Self { writer, written: 0 })
    }

    /// Appends one record with its raw local timestamps.
    pub fn write(&mut self, record: &TripRecord) -> Result<()> {
        self.writer.write_record(&[
            format_timestamp(record.pickup_datetime),
            format_timestamp(record.dropoff_datetime),
            optional(record.passenger_count),
            optional(record.trip_distance),
            record.store_and_fwd_flag.clone().unwrap_or_default(),
            optional(record.pickup_location_id),
            optional(record.dropoff_location_id),
            optional(record.fare_amount),
            optional(record.tip_amount),
        ])?;
        self.written += 1;
        Ok(())
    }

    /// Number of duplicate rows written so far, header excluded.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes everything and hands back the underlying writer.
    ///
    /// # Errors
    /// Returns `PipelineError::Io` if buffered rows cannot be flushed.
    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))
    }
}

fn format_timestamp(value: NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Bound values for one record, ordered as `COLUMN_MAPPING`.
pub fn column_values(record: &TripRecord) -> [Value; 9] {
    [
        Value::Text(format_timestamp(record.pickup_datetime)),
        Value::Text(format_timestamp(record.dropoff_datetime)),
        record
            .passenger_count
            .map_or(Value::Null, |v| Value::Integer(i64::from(v))),
        record.trip_distance.map_or(Value::Null, Value::Real),
        record
            .store_and_fwd_flag
            .clone()
            .map_or(Value::Null, Value::Text),
        record
            .pickup_location_id
            .map_or(Value::Null, |v| Value::Integer(i64::from(v))),
        record
            .dropoff_location_id
            .map_or(Value::Null, |v| Value::Integer(i64::from(v))),
        record.fare_amount.map_or(Value::Null, Value::Real),
        record.tip_amount.map_or(Value::Null, Value::Real),
    ]
}

fn insert_sql() -> String {
    let columns: Vec<&str> = COLUMN_MAPPING.iter().map(|(_, column)| *column).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        TABLE,
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Destination that replaces its whole content with one batch of trips.
pub trait BulkLoader {
    /// Clears the destination and writes `records`, returning rows written.
    fn load(&mut self, records: &[TripRecord]) -> Result<usize>;

    /// Current number of rows in the destination.
    fn row_count(&self) -> Result<u64>;
}

/// SQLite-backed `Trips` table.
pub struct SqliteLoader {
    conn: Connection,
}

impl SqliteLoader {
    /// Opens (or creates) the database at `path` and makes sure `Trips` exists.
    ///
    /// # Arguments
    /// * `path` - SQLite database file
    ///
    /// # Returns
    /// Returns a loader holding one open connection.
    ///
    /// # Errors
    /// Returns `PipelineError::Sql` if the database cannot be opened or the
    /// table cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening database {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    /// Same as `open`, against a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl BulkLoader for SqliteLoader {
    /// Runs the clear and the inserts in a single transaction. A failure at
    /// any point rolls back, leaving the previous table content in place.
    fn load(&mut self, records: &[TripRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let cleared = tx.execute(&format!("DELETE FROM {}", TABLE), [])?;
        debug!("Cleared {} existing rows from {}", cleared, TABLE);

        let mut written = 0;
        {
            let mut insert = tx.prepare(&insert_sql())?;
            for record in records {
                insert.execute(params_from_iter(column_values(record)))?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn row_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", TABLE), [], |row| {
                    row.get(0)
                })?;
        u64::try_from(count)
            .map_err(|_| PipelineError::Data(format!("negative row count {}", count)))
    }
}

/// Writes the run report to a pretty-formatted JSON file.
///
/// # Arguments
/// * `report` - Counts gathered during the run
/// * `output_path` - Path where the JSON file will be created
///
/// # Returns
/// Returns `Ok(())` on success.
///
/// # Errors
/// Returns error if file cannot be created or serialization fails.
pub fn write_report(report: &RunReport, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
