//! End-to-end import runs against scratch files and a scratch SQLite database.

use arrow_array::{
    ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{NaiveDate, NaiveDateTime};
use lib::{
    BulkLoader, InputFormat, PipelineConfig, PipelineError, Result, SqliteLoader, Stage,
    TripRecord, run, run_with,
};
use parquet::arrow::ArrowWriter;
use rusqlite::Connection;
use std::cell::Cell;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tempfile::TempDir;

const HEADER: &str = "VendorID,tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance,RatecodeID,store_and_fwd_flag,PULocationID,DOLocationID,payment_type,fare_amount,tip_amount";

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

fn config_for(dir: &TempDir, input: PathBuf) -> PipelineConfig {
    PipelineConfig {
        input,
        duplicates: dir.path().join("duplicates.csv"),
        database: dir.path().join("taxi.db"),
        ..PipelineConfig::default()
    }
}

fn write_csv(dir: &TempDir, name: &str, rows: &[&str]) -> PathBuf {
    let path = dir.path().join(name);
    let mut body = String::from(HEADER);
    body.push('\n');
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    fs::write(&path, body).unwrap();
    path
}

fn table_rows(database: &Path) -> Vec<(String, String, Option<i64>, Option<String>)> {
    let conn = Connection::open(database).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT tpep_pickup_datetime, tpep_dropoff_datetime, passenger_count, store_and_fwd_flag \
             FROM Trips ORDER BY tpep_pickup_datetime",
        )
        .unwrap();
    stmt.query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })
    .unwrap()
    .collect::<rusqlite::Result<_>>()
    .unwrap()
}

#[test]
fn duplicates_are_split_out_and_survivors_loaded() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &[
            "1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47",
            "2,2024-01-01 08:00:00,2024-01-01 08:10:00,1,3.4,1,Y,100,101,2,9,0",
            "1,2024-07-04 20:00:00,2024-07-04 20:25:00,,5.0,1,Y,48,68,1,21.5,4",
            "1,2024-07-04 20:00:00,2024-07-04 20:25:00,0,5.0,1,N,48,68,1,21.5,4",
        ],
    );
    let config = config_for(&dir, input);

    let report = run(&config).unwrap();

    assert_eq!(report.total_rows, 4);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.rows_written, 2);
    assert_eq!(report.table_row_count, 2);
    assert_eq!(report.format, InputFormat::Csv);

    assert_eq!(
        table_rows(&config.database),
        vec![
            (
                "2024-01-01 13:00:00".to_string(),
                "2024-01-01 13:10:00".to_string(),
                Some(1),
                Some("No".to_string()),
            ),
            (
                "2024-07-05 00:00:00".to_string(),
                "2024-07-05 00:25:00".to_string(),
                None,
                Some("Yes".to_string()),
            ),
        ]
    );

    let duplicates = fs::read_to_string(&config.duplicates).unwrap();
    let lines: Vec<&str> = duplicates.lines().collect();
    assert_eq!(
        lines,
        vec![
            "tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance,store_and_fwd_flag,PULocationID,DOLocationID,fare_amount,tip_amount",
            "2024-01-01 08:00:00,2024-01-01 08:10:00,1,3.4,Y,100,101,9,0",
            "2024-07-04 20:00:00,2024-07-04 20:25:00,0,5,N,48,68,21.5,4",
        ]
    );
}

#[test]
fn rerun_with_same_input_keeps_the_same_count() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &[
            "1,01/15/2020 09:00:00 AM,01/15/2020 09:12:00 AM,2,1.0,1,N,1,2,1,5,1",
            "1,01/15/2020 09:30:00 AM,01/15/2020 09:45:00 AM,2,1.0,1,N,1,2,1,5,1",
            "1,01/15/2020 09:30:00 AM,01/15/2020 09:45:00 AM,2,1.0,1,N,1,2,1,5,1",
        ],
    );
    let config = config_for(&dir, input);

    let first = run(&config).unwrap();
    let second = run(&config).unwrap();

    assert_eq!(first.table_row_count, 2);
    assert_eq!(second.table_row_count, 2);
    assert_eq!(second.duplicates, 1);
}

#[test]
fn header_only_input_empties_the_table() {
    let dir = TempDir::new().unwrap();
    let full = write_csv(
        &dir,
        "full.csv",
        &["1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47"],
    );
    run(&config_for(&dir, full)).unwrap();

    let empty = write_csv(&dir, "empty.csv", &[]);
    let config = config_for(&dir, empty);
    let report = run(&config).unwrap();

    assert_eq!(report.total_rows, 0);
    assert_eq!(report.accepted, 0);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.table_row_count, 0);
    assert!(table_rows(&config.database).is_empty());
    assert_eq!(
        fs::read_to_string(&config.duplicates).unwrap().lines().count(),
        1
    );
}

#[test]
fn missing_input_aborts_before_touching_the_database() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, dir.path().join("nope.csv"));

    let err = run(&config).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Transform));
    assert!(!config.database.exists());
}

#[test]
fn corrupt_row_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &[
            "1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47",
            "1,sometime,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47",
        ],
    );
    let config = config_for(&dir, input);

    let err = run(&config).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Transform));
    assert!(!config.database.exists());
}

#[test]
fn unknown_time_zones_abort() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(&dir, "trips.csv", &[]);
    let config = PipelineConfig {
        timezone: "Mars/Olympus_Mons".to_string(),
        timezone_fallback: "Mars/Jezero".to_string(),
        ..config_for(&dir, input)
    };

    let err = run(&config).unwrap_err();
    match err {
        PipelineError::Stage { stage, source } => {
            assert_eq!(stage, Stage::Transform);
            assert!(matches!(*source, PipelineError::TimeZone(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
}

struct BrokenLoader {
    counted: Rc<Cell<bool>>,
}

impl BulkLoader for BrokenLoader {
    fn load(&mut self, _records: &[TripRecord]) -> Result<usize> {
        Err(PipelineError::Data("destination unreachable".to_string()))
    }

    fn row_count(&self) -> Result<u64> {
        self.counted.set(true);
        Ok(0)
    }
}

#[test]
fn failed_load_skips_verification() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &["1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47"],
    );
    let config = config_for(&dir, input);
    let counted = Rc::new(Cell::new(false));
    let loader = BrokenLoader {
        counted: Rc::clone(&counted),
    };

    let err = run_with(&config, || Ok(loader)).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Load));
    assert!(!counted.get());
}

#[test]
fn writes_json_report() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &[
            "1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47",
            "1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47",
        ],
    );
    let report_path = dir.path().join("report.json");
    let config = PipelineConfig {
        report: Some(report_path.clone()),
        ..config_for(&dir, input)
    };

    run_with(&config, SqliteLoader::open_in_memory).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(report_path).unwrap()).unwrap();
    assert_eq!(json["total_rows"], 2);
    assert_eq!(json["accepted"], 1);
    assert_eq!(json["duplicates"], 1);
    assert_eq!(json["table_row_count"], 1);
    assert_eq!(json["format"], "csv");
    assert_eq!(json["timezone"], "America/New_York");
}

fn write_parquet(path: &Path) {
    let schema = Arc::new(Schema::new(vec![
        Field::new(
            "tpep_pickup_datetime",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new(
            "tpep_dropoff_datetime",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new("passenger_count", DataType::Float64, true),
        Field::new("trip_distance", DataType::Float64, true),
        Field::new("store_and_fwd_flag", DataType::Utf8, true),
        Field::new("PULocationID", DataType::Int32, true),
        Field::new("DOLocationID", DataType::Int32, true),
        Field::new("fare_amount", DataType::Float64, true),
        Field::new("tip_amount", DataType::Float64, true),
    ]));

    let micros = |t: NaiveDateTime| t.and_utc().timestamp_micros();
    let pickups = vec![
        micros(at(2024, 1, 1, 8, 0)),
        micros(at(2024, 1, 1, 8, 0)),
        micros(at(2024, 6, 1, 12, 0)),
    ];
    let dropoffs = vec![
        micros(at(2024, 1, 1, 8, 10)),
        micros(at(2024, 1, 1, 8, 10)),
        micros(at(2024, 6, 1, 12, 30)),
    ];

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(pickups)),
        Arc::new(TimestampMicrosecondArray::from(dropoffs)),
        Arc::new(Float64Array::from(vec![Some(1.0), Some(1.0), None])),
        Arc::new(Float64Array::from(vec![Some(1.2), Some(1.2), Some(7.8)])),
        Arc::new(StringArray::from(vec![Some("N"), Some("N"), Some("Y")])),
        Arc::new(Int32Array::from(vec![Some(238), Some(238), Some(132)])),
        Arc::new(Int32Array::from(vec![Some(239), Some(239), None])),
        Arc::new(Float64Array::from(vec![Some(6.0), Some(6.0), Some(52.0)])),
        Arc::new(Float64Array::from(vec![Some(1.47), Some(1.47), Some(10.0)])),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();

    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

#[test]
fn imports_parquet_input() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("yellow_tripdata_2024-01.parquet");
    write_parquet(&input);
    let config = config_for(&dir, input);

    let report = run(&config).unwrap();

    assert_eq!(report.format, InputFormat::Parquet);
    assert_eq!(report.total_rows, 3);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.duplicates, 1);
    assert_eq!(
        table_rows(&config.database),
        vec![
            (
                "2024-01-01 13:00:00".to_string(),
                "2024-01-01 13:10:00".to_string(),
                Some(1),
                Some("No".to_string()),
            ),
            (
                "2024-06-01 16:00:00".to_string(),
                "2024-06-01 16:30:00".to_string(),
                None,
                Some("Yes".to_string()),
            ),
        ]
    );
}

#[test]
fn unwritable_report_does_not_fail_a_committed_import() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &["1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47"],
    );
    let config = PipelineConfig {
        report: Some(dir.path().join("missing-dir").join("report.json")),
        ..config_for(&dir, input)
    };

    let report = run(&config).unwrap();

    assert_eq!(report.table_row_count, 1);
    assert_eq!(table_rows(&config.database).len(), 1);
    assert!(!dir.path().join("missing-dir").exists());
}

/// Accepts every batch but reports a table size of its own.
struct SkewedLoader {
    reported: u64,
}

impl BulkLoader for SkewedLoader {
    fn load(&mut self, records: &[TripRecord]) -> Result<usize> {
        Ok(records.len())
    }

    fn row_count(&self) -> Result<u64> {
        Ok(self.reported)
    }
}

#[test]
fn count_mismatch_after_load_is_reported_not_fatal() {
    let dir = TempDir::new().unwrap();
    let input = write_csv(
        &dir,
        "trips.csv",
        &[
            "1,2024-01-01 08:00:00,2024-01-01 08:10:00,1,1.2,1,N,238,239,1,6,1.47",
            "1,2024-01-01 09:00:00,2024-01-01 09:10:00,1,1.2,1,N,238,239,1,6,1.47",
        ],
    );
    let config = config_for(&dir, input);

    let report = run_with(&config, || Ok(SkewedLoader { reported: 7 })).unwrap();

    assert_eq!(report.accepted, 2);
    assert_eq!(report.rows_written, 2);
    assert_eq!(report.table_row_count, 7);
}
