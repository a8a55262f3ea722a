use crate::error::{PipelineError, Result};
use crate::structs::{InputFormat, TripRecord};
use arrow_array::{
    Array, ArrayRef, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array, Int64Array,
    LargeStringArray, RecordBatch, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, UInt8Array,
    UInt16Array, UInt32Array, UInt64Array,
};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use log::debug;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use serde::{Deserialize, Deserializer, de};
use std::{fs::File, io::Read, path::Path};

/// Accepted timestamp layouts, tried in order.
const TIMESTAMP_FORMATS: [&str; 5] = [
    "%m/%d/%Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const PICKUP_COLUMNS: [&str; 2] = ["tpep_pickup_datetime", "pickup_datetime"];
const DROPOFF_COLUMNS: [&str; 2] = ["tpep_dropoff_datetime", "dropoff_datetime"];
const PASSENGER_COLUMNS: [&str; 1] = ["passenger_count"];
const DISTANCE_COLUMNS: [&str; 1] = ["trip_distance"];
const FLAG_COLUMNS: [&str; 1] = ["store_and_fwd_flag"];
const PICKUP_LOCATION_COLUMNS: [&str; 2] = ["PULocationID", "pickup_location_id"];
const DROPOFF_LOCATION_COLUMNS: [&str; 2] = ["DOLocationID", "dropoff_location_id"];
const FARE_COLUMNS: [&str; 1] = ["fare_amount"];
const TIP_COLUMNS: [&str; 1] = ["tip_amount"];

/// Header names accepted for each `TripRecord` field.
const FIELD_COLUMNS: [&[&str]; 9] = [
    &PICKUP_COLUMNS,
    &DROPOFF_COLUMNS,
    &PASSENGER_COLUMNS,
    &DISTANCE_COLUMNS,
    &FLAG_COLUMNS,
    &PICKUP_LOCATION_COLUMNS,
    &DROPOFF_LOCATION_COLUMNS,
    &FARE_COLUMNS,
    &TIP_COLUMNS,
];

/// Stream of trip records in input order.
pub type TripStream = Box<dyn Iterator<Item = Result<TripRecord>>>;

/// Opens an input file and returns a lazy stream of trip records.
///
/// # Arguments
/// * `path` - Input file holding trip records
/// * `format` - Layout of the file (CSV with header row, or Parquet)
///
/// # Returns
/// Returns a boxed iterator yielding one `Result<TripRecord>` per row, in file order.
///
/// # Errors
/// Returns error if the file cannot be opened or, for Parquet, if the footer
/// cannot be read. These surface before any record is consumed; row-level
/// failures are yielded by the iterator instead.
pub fn open_records(path: &Path, format: InputFormat) -> Result<TripStream> {
    debug!("Opening {:?} input: {}", format, path.display());
    let file = File::open(path)?;
    match format {
        InputFormat::Csv => Ok(Box::new(csv_records(file))),
        InputFormat::Parquet => Ok(Box::new(ParquetRecords::new(file)?)),
    }
}

/// Reads header-delimited CSV, one `TripRecord` per row.
///
/// Fields are trimmed, unknown columns are ignored and short rows are allowed.
/// When several header columns name the same field (for instance both
/// `tpep_pickup_datetime` and `pickup_datetime`), the leftmost one is used and
/// the others are ignored.
///
/// # Arguments
/// * `input` - Any reader positioned at the header row
///
/// # Returns
/// Returns an iterator of records in input order. A row whose pickup or
/// dropoff time is missing or unparseable yields `PipelineError::Csv`.
pub fn csv_records<R: Read>(input: R) -> impl Iterator<Item = Result<TripRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input);
    if let Ok(headers) = reader.headers().cloned() {
        reader.set_headers(first_column_wins(&headers));
    }
    reader
        .into_deserialize::<TripRecord>()
        .map(|row| row.map_err(PipelineError::from))
}

/// Blanks every header that names a field already claimed by an earlier column.
fn first_column_wins(headers: &StringRecord) -> StringRecord {
    let mut claimed = [false; FIELD_COLUMNS.len()];
    headers
        .iter()
        .map(|header| {
            match FIELD_COLUMNS
                .iter()
                .position(|names| names.contains(&header))
            {
                Some(field) if claimed[field] => "",
                Some(field) => {
                    claimed[field] = true;
                    header
                }
                None => header,
            }
        })
        .collect()
}

/// Parses a timestamp in any of the accepted layouts.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

pub(crate) fn deserialize_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp '{}'", raw)))
}

/// Loose integer field: empty, malformed or out-of-range values become `None`.
pub(crate) fn deserialize_loose_int<'de, D, T>(
    deserializer: D,
) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_loose_int))
}

/// Accepts `"3"` as well as integral floats such as `"3.0"`.
fn parse_loose_int<T: TryFrom<i64>>(raw: &str) -> Option<T> {
    let raw = raw.trim();
    let value = raw
        .parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().and_then(integral))?;
    T::try_from(value).ok()
}

/// Loose decimal field: empty, malformed or non-finite values become `None`.
pub(crate) fn deserialize_loose_float<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_loose_float))
}

/// Rejects `NaN` and infinities, which SQLite would store as NULL.
fn parse_loose_float(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 {
        Some(value as i64)
    } else {
        None
    }
}

/// Streams trip records out of a Parquet file one batch at a time.
pub struct ParquetRecords {
    reader: ParquetRecordBatchReader,
    batch: Option<RecordBatch>,
    row: usize,
    rows_read: usize,
}

impl ParquetRecords {
    pub fn new(file: File) -> Result<Self> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        Ok(Self {
            reader,
            batch: None,
            row: 0,
            rows_read: 0,
        })
    }
}

impl Iterator for ParquetRecords {
    type Item = Result<TripRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = &self.batch {
                if self.row < batch.num_rows() {
                    let record = record_at(batch, self.row, self.rows_read + 1);
                    self.row += 1;
                    self.rows_read += 1;
                    return Some(record);
                }
            }
            match self.reader.next()? {
                Ok(batch) => {
                    debug!("Read Parquet batch of {} rows", batch.num_rows());
                    self.batch = Some(batch);
                    self.row = 0;
                }
                Err(e) => return Some(Err(PipelineError::Arrow(e))),
            }
        }
    }
}

/// Builds one record from row `row` of `batch`; `ordinal` is only used in errors.
fn record_at(batch: &RecordBatch, row: usize, ordinal: usize) -> Result<TripRecord> {
    let pickup = column(batch, &PICKUP_COLUMNS)
        .and_then(|col| timestamp_at(col, row))
        .ok_or_else(|| {
            PipelineError::Data(format!("row {}: missing or unreadable pickup time", ordinal))
        })?;
    let dropoff = column(batch, &DROPOFF_COLUMNS)
        .and_then(|col| timestamp_at(col, row))
        .ok_or_else(|| {
            PipelineError::Data(format!("row {}: missing or unreadable dropoff time", ordinal))
        })?;

    Ok(TripRecord {
        pickup_datetime: pickup,
        dropoff_datetime: dropoff,
        passenger_count: int_field(batch, &PASSENGER_COLUMNS, row),
        trip_distance: float_field(batch, &DISTANCE_COLUMNS, row),
        store_and_fwd_flag: column(batch, &FLAG_COLUMNS).and_then(|col| str_at(col, row)),
        pickup_location_id: int_field(batch, &PICKUP_LOCATION_COLUMNS, row),
        dropoff_location_id: int_field(batch, &DROPOFF_LOCATION_COLUMNS, row),
        fare_amount: float_field(batch, &FARE_COLUMNS, row),
        tip_amount: float_field(batch, &TIP_COLUMNS, row),
    })
}

fn column<'a>(batch: &'a RecordBatch, names: &[&str]) -> Option<&'a ArrayRef> {
    names.iter().find_map(|name| batch.column_by_name(name))
}

fn int_field<T: TryFrom<i64>>(batch: &RecordBatch, names: &[&str], row: usize) -> Option<T> {
    column(batch, names)
        .and_then(|col| int_at(col, row))
        .and_then(|value| T::try_from(value).ok())
}

fn float_field(batch: &RecordBatch, names: &[&str], row: usize) -> Option<f64> {
    column(batch, names).and_then(|col| float_at(col, row))
}

fn timestamp_at(col: &ArrayRef, row: usize) -> Option<NaiveDateTime> {
    if col.is_null(row) {
        return None;
    }
    let any = col.as_any();
    if let Some(a) = any.downcast_ref::<TimestampMicrosecondArray>() {
        return a.value_as_datetime(row);
    }
    if let Some(a) = any.downcast_ref::<TimestampNanosecondArray>() {
        return a.value_as_datetime(row);
    }
    if let Some(a) = any.downcast_ref::<TimestampMillisecondArray>() {
        return a.value_as_datetime(row);
    }
    if let Some(a) = any.downcast_ref::<TimestampSecondArray>() {
        return a.value_as_datetime(row);
    }
    str_at(col, row).and_then(|raw| parse_timestamp(&raw))
}

fn int_at(col: &ArrayRef, row: usize) -> Option<i64> {
    if col.is_null(row) {
        return None;
    }
    let any = col.as_any();
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Some(a.value(row));
    }
    if let Some(a) = any.downcast_ref::<Int32Array>() {
        return Some(i64::from(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<Int16Array>() {
        return Some(i64::from(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<Int8Array>() {
        return Some(i64::from(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<UInt64Array>() {
        return i64::try_from(a.value(row)).ok();
    }
    if let Some(a) = any.downcast_ref::<UInt32Array>() {
        return Some(i64::from(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<UInt16Array>() {
        return Some(i64::from(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<UInt8Array>() {
        return Some(i64::from(a.value(row)));
    }
    // Older TLC files store counts and zone ids as doubles
    if let Some(a) = any.downcast_ref::<Float64Array>() {
        return integral(a.value(row));
    }
    if let Some(a) = any.downcast_ref::<Float32Array>() {
        return integral(f64::from(a.value(row)));
    }
    str_at(col, row).and_then(|raw| parse_loose_int(&raw))
}

fn float_at(col: &ArrayRef, row: usize) -> Option<f64> {
    if col.is_null(row) {
        return None;
    }
    let any = col.as_any();
    if let Some(a) = any.downcast_ref::<Float64Array>() {
        return Some(a.value(row)).filter(|v| v.is_finite());
    }
    if let Some(a) = any.downcast_ref::<Float32Array>() {
        return Some(f64::from(a.value(row))).filter(|v| v.is_finite());
    }
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Some(a.value(row) as f64);
    }
    if let Some(a) = any.downcast_ref::<Int32Array>() {
        return Some(f64::from(a.value(row)));
    }
    str_at(col, row).and_then(|raw| parse_loose_float(&raw))
}

fn str_at(col: &ArrayRef, row: usize) -> Option<String> {
    if col.is_null(row) {
        return None;
    }
    let any = col.as_any();
    let value = if let Some(a) = any.downcast_ref::<StringArray>() {
        a.value(row)
    } else if let Some(a) = any.downcast_ref::<LargeStringArray>() {
        a.value(row)
    } else {
        return None;
    };
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
