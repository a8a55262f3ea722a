use chrono::NaiveDateTime;
use log::{Log, Metadata, Record as LogRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Simple logger implementation
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &LogRecord) {
        if self.enabled(record.metadata()) {
            println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// One taxi trip as read from the input file.
///
/// Header matching accepts both the TLC column names and the plain snake_case
/// names. Timestamps are required; every other field is loose and becomes
/// `None` when missing or unparseable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TripRecord {
    #[serde(
        rename = "tpep_pickup_datetime",
        alias = "pickup_datetime",
        deserialize_with = "crate::extract::deserialize_timestamp"
    )]
    pub pickup_datetime: NaiveDateTime,
    #[serde(
        rename = "tpep_dropoff_datetime",
        alias = "dropoff_datetime",
        deserialize_with = "crate::extract::deserialize_timestamp"
    )]
    pub dropoff_datetime: NaiveDateTime,
    #[serde(default, deserialize_with = "crate::extract::deserialize_loose_int")]
    pub passenger_count: Option<u32>,
    #[serde(default, deserialize_with = "crate::extract::deserialize_loose_float")]
    pub trip_distance: Option<f64>,
    #[serde(default)]
    pub store_and_fwd_flag: Option<String>,
    #[serde(
        rename = "PULocationID",
        alias = "pickup_location_id",
        default,
        deserialize_with = "crate::extract::deserialize_loose_int"
    )]
    pub pickup_location_id: Option<i32>,
    #[serde(
        rename = "DOLocationID",
        alias = "dropoff_location_id",
        default,
        deserialize_with = "crate::extract::deserialize_loose_int"
    )]
    pub dropoff_location_id: Option<i32>,
    #[serde(default, deserialize_with = "crate::extract::deserialize_loose_float")]
    pub fare_amount: Option<f64>,
    #[serde(default, deserialize_with = "crate::extract::deserialize_loose_float")]
    pub tip_amount: Option<f64>,
}

impl TripRecord {
    /// Record with only the required timestamps set.
    pub fn new(pickup_datetime: NaiveDateTime, dropoff_datetime: NaiveDateTime) -> Self {
        Self {
            pickup_datetime,
            dropoff_datetime,
            passenger_count: None,
            trip_distance: None,
            store_and_fwd_flag: None,
            pickup_location_id: None,
            dropoff_location_id: None,
            fare_amount: None,
            tip_amount: None,
        }
    }
}

/// Composite key used to detect duplicate trips within one run.
///
/// Built from the raw source-local timestamps, so it must be taken before the
/// record is normalized. An absent passenger count keys as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TripKey {
    pub pickup: NaiveDateTime,
    pub dropoff: NaiveDateTime,
    pub passenger_count: u32,
}

impl TripKey {
    pub fn of(record: &TripRecord) -> Self {
        Self {
            pickup: record.pickup_datetime,
            dropoff: record.dropoff_datetime,
            passenger_count: record.passenger_count.unwrap_or(0),
        }
    }
}

/// Layout of the input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Csv,
    Parquet,
}

impl InputFormat {
    /// Guesses the format from the file extension, defaulting to CSV.
    pub fn detect(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("parquet") | Some("pq") => InputFormat::Parquet,
            _ => InputFormat::Csv,
        }
    }
}

/// Configuration for one import run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub duplicates: PathBuf,
    pub database: PathBuf,
    pub timezone: String,
    pub timezone_fallback: String,
    pub format: Option<InputFormat>,
    pub report: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn input_format(&self) -> InputFormat {
        self.format.unwrap_or_else(|| InputFormat::detect(&self.input))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("sample-cab-data.csv"),
            duplicates: PathBuf::from("duplicates.csv"),
            database: PathBuf::from("taxi.db"),
            timezone: "America/New_York".to_string(),
            timezone_fallback: "US/Eastern".to_string(),
            format: None,
            report: None,
        }
    }
}

/// Row counts gathered across the stages of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub input: PathBuf,
    pub format: InputFormat,
    pub timezone: String,
    pub total_rows: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rows_written: usize,
    pub table_row_count: u64,
    pub elapsed_ms: u64,
}
