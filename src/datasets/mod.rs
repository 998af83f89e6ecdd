//! Loading and cleaning of the raw input tables.
//!
//! [`crash::BikeCrashDataset`] turns NYPD collision extracts into projected
//! bike-crash points; [`citibike::CitibikeDataset`] turns trip logs into rides
//! and a station table that defines the study area.

pub mod citibike;
pub mod crash;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use csv::StringRecord;
use std::collections::HashMap;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%Y-%m-%dT%H:%M:%S%.f"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// Parses the timestamp layouts seen in trip logs and collision extracts.
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

/// Combines a separate date and time column, as the collision table stores them.
pub fn parse_date_and_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = date.trim();
    let time = time.trim();

    let day = DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(date, fmt)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(date, fmt).ok().map(|dt| dt.date()))
    })?;
    let clock = TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(time, fmt).ok())?;

    Some(day.and_time(clock))
}

/// Minutes since midnight for an `H:MM` (or `H:MM:SS`) clock string.
pub fn clock_minutes(value: &str) -> Option<u32> {
    let mut parts = value.trim().split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = parts.next()?.trim().parse().ok()?;
    if let Some(second) = parts.next() {
        second.trim().parse::<f64>().ok()?;
    }
    if parts.next().is_some() || hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}

/// Column-name lookup over a CSV header row.
pub(crate) struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    pub(crate) fn new(headers: &StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();
        Self { index }
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names from `required` that are not present, in order.
    pub(crate) fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required.iter().copied().filter(|c| !self.has(c)).collect()
    }

    /// Field value, with empty cells treated as missing.
    pub(crate) fn get<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        let i = *self.index.get(name)?;
        record.get(i).map(str::trim).filter(|v| !v.is_empty())
    }

    pub(crate) fn get_f64(&self, record: &StringRecord, name: &str) -> Option<f64> {
        self.get(record, name)?
            .parse::<f64>()
            .ok()
            .filter(|v| !v.is_nan())
    }
}

/// Timestamps written as `"%Y-%m-%d %H:%M:%S"`.
pub(crate) mod datetime_format {
    use chrono::NaiveDateTime;
    use serde::Serializer;

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.format(FORMAT).to_string())
    }

    /// Optional variant, read back with any of [`parse_datetime`](super::parse_datetime)'s
    /// layouts; unparsable or empty values become `None`.
    pub mod option {
        use super::FORMAT;
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<NaiveDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_str(&dt.format(FORMAT).to_string()),
                None => s.serialize_str(""),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            Ok(raw.as_deref().and_then(crate::datasets::parse_datetime))
        }
    }
}
