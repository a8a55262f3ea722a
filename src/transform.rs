use crate::error::{PipelineError, Result};
use crate::load::DuplicateSink;
use crate::structs::{TripKey, TripRecord};
use chrono::{LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone};
use chrono_tz::Tz;
use log::debug;
use std::{collections::HashSet, io::Write};

const PROGRESS_EVERY: usize = 100_000;

/// Windows zone names for the US mainland, mapped to their IANA equivalents.
const WINDOWS_ZONES: [(&str, &str); 4] = [
    ("Eastern Standard Time", "America/New_York"),
    ("Central Standard Time", "America/Chicago"),
    ("Mountain Standard Time", "America/Denver"),
    ("Pacific Standard Time", "America/Los_Angeles"),
];

/// Result of one streaming pass over the input.
#[derive(Debug, Default)]
pub struct TransformOutput {
    /// First-seen records, normalized, in input order.
    pub accepted: Vec<TripRecord>,
    pub total_rows: usize,
    pub duplicates: usize,
}

/// Routes each record to either the accepted set or the duplicates sink.
///
/// The uniqueness key is taken from the raw record before any normalization.
/// A record whose key is already in `seen` is written to `duplicates`
/// untouched; otherwise its key is recorded, its store-and-forward flag is
/// expanded and both timestamps are converted from `zone` to UTC.
///
/// # Errors
///
/// Any read error from `records` aborts the pass, as does a failure to write
/// to the duplicates sink or to place a timestamp in `zone`.
pub fn transform<I, W>(
    records: I,
    seen: &mut HashSet<TripKey>,
    duplicates: &mut DuplicateSink<W>,
    zone: Tz,
) -> Result<TransformOutput>
where
    I: IntoIterator<Item = Result<TripRecord>>,
    W: Write,
{
    let mut output = TransformOutput::default();

    for record in records {
        let mut record = record?;
        output.total_rows += 1;
        if output.total_rows % PROGRESS_EVERY == 0 {
            debug!(
                "{} rows read, {} duplicates so far",
                output.total_rows, output.duplicates
            );
        }

        if !seen.insert(TripKey::of(&record)) {
            duplicates.write(&record)?;
            output.duplicates += 1;
            continue;
        }

        normalize(&mut record, zone)?;
        output.accepted.push(record);
    }

    println!(
        "Read {} rows: {} accepted, {} duplicates",
        output.total_rows,
        output.accepted.len(),
        output.duplicates
    );
    Ok(output)
}

/// Normalizes an accepted record in place.
pub fn normalize(record: &mut TripRecord, zone: Tz) -> Result<()> {
    expand_flag(&mut record.store_and_fwd_flag);
    record.pickup_datetime = to_utc(record.pickup_datetime, zone)?;
    record.dropoff_datetime = to_utc(record.dropoff_datetime, zone)?;
    Ok(())
}

/// `"Y"` becomes `"Yes"` and `"N"` becomes `"No"`; anything else is kept.
pub fn expand_flag(flag: &mut Option<String>) {
    let expanded = match flag.as_deref() {
        Some("Y") => "Yes",
        Some("N") => "No",
        _ => return,
    };
    *flag = Some(expanded.to_string());
}

/// Converts a civil time in `zone` to UTC.
///
/// Ambiguous times (clocks falling back) are read as standard time. Times that
/// fall in a spring-forward gap are read with the offset in effect before it.
pub fn to_utc(local: NaiveDateTime, zone: Tz) -> Result<NaiveDateTime> {
    match zone.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.naive_utc()),
        LocalResult::Ambiguous(earliest, latest) => Ok(earliest.max(latest).naive_utc()),
        LocalResult::None => {
            let before_gap = local
                .checked_sub_signed(TimeDelta::days(1))
                .ok_or_else(|| PipelineError::TimeZone(format!("{} is out of range", local)))?;
            let offset = zone.offset_from_utc_datetime(&before_gap).fix();
            local
                .checked_sub_signed(TimeDelta::seconds(i64::from(offset.local_minus_utc())))
                .ok_or_else(|| PipelineError::TimeZone(format!("{} is out of range", local)))
        }
    }
}

/// Resolves the source civil time zone, trying `fallback` if `primary` is unknown.
///
/// Both IANA names and the Windows names of the US mainland zones are accepted.
pub fn resolve_timezone(primary: &str, fallback: &str) -> Result<Tz> {
    if let Some(zone) = parse_zone(primary) {
        return Ok(zone);
    }
    debug!(
        "Time zone '{}' not recognized, trying '{}'",
        primary, fallback
    );
    parse_zone(fallback).ok_or_else(|| {
        PipelineError::TimeZone(format!(
            "neither '{}' nor '{}' is a known time zone",
            primary, fallback
        ))
    })
}

fn parse_zone(id: &str) -> Option<Tz> {
    let id = id.trim();
    id.parse::<Tz>().ok().or_else(|| {
        WINDOWS_ZONES
            .iter()
            .find(|(windows, _)| windows.eq_ignore_ascii_case(id))
            .and_then(|(_, iana)| iana.parse::<Tz>().ok())
    })
}
