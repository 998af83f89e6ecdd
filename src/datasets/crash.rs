//! NYPD motor vehicle collisions reduced to geolocated bike crashes.

use crate::datasets::{Columns, clock_minutes, datetime_format, parse_date_and_time};
use crate::error::{Error, Result};
use crate::geo::to_web_mercator;
use crate::raster::{RasterCell, RasterSpec, TimedPoint, rasterize};
use crate::source::{read_tables, read_tables_from_bytes};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Columns present once a collision table has been processed.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "CRASH DATE",
    "CRASH TIME",
    "LATITUDE",
    "LONGITUDE",
    "CRASH_DATETIME",
    "x",
    "y",
];

/// Columns a raw collision table must carry to be processed.
const RAW_COLUMNS: &[&str] = &["CRASH DATE", "CRASH TIME", "LATITUDE", "LONGITUDE"];

const CYCLIST_INJURED: &str = "NUMBER OF CYCLIST INJURED";
const CYCLIST_KILLED: &str = "NUMBER OF CYCLIST KILLED";

const VEHICLE_TYPE_COLUMNS: &[&str] = &[
    "VEHICLE TYPE CODE 1",
    "VEHICLE TYPE CODE 2",
    "VEHICLE TYPE CODE 3",
    "VEHICLE TYPE CODE 4",
    "VEHICLE TYPE CODE 5",
];

/// Substrings of a lower-cased vehicle type that mark a bicycle ("Bike", "bicycle", "E-Bike").
const BIKE_MARKERS: &[&str] = &["bic", "bik"];

/// A single bike crash with its Web Mercator position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    #[serde(rename = "CRASH DATE")]
    pub crash_date: String,
    #[serde(rename = "CRASH TIME")]
    pub crash_time: String,
    #[serde(rename = "LATITUDE")]
    pub latitude: f64,
    #[serde(rename = "LONGITUDE")]
    pub longitude: f64,
    #[serde(rename = "CRASH_DATETIME", with = "datetime_format::option", default)]
    pub crash_datetime: Option<NaiveDateTime>,
    pub x: f64,
    pub y: f64,
    /// Position relative to the citibike station centroid, set by alignment.
    #[serde(skip)]
    pub centered: Option<(f64, f64)>,
}

/// Translation and bounding box derived from the citibike station network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentFrame {
    pub x_center: f64,
    pub y_center: f64,
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl AlignmentFrame {
    fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Row counts from processing a raw collision table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleaningStats {
    pub input_rows: usize,
    pub bike_rows: usize,
    pub missing_essentials: usize,
    pub zero_coordinates: usize,
    pub unparsed_datetimes: usize,
    pub kept: usize,
}

/// Bike crashes extracted from NYPD collision data.
#[derive(Debug, Default, Clone)]
pub struct BikeCrashDataset {
    crashes: Vec<CrashRecord>,
    stats: CleaningStats,
    aligned: bool,
}

impl BikeCrashDataset {
    /// Loads crashes from a CSV, gzipped CSV, ZIP archive or directory.
    ///
    /// Tables that already carry [`REQUIRED_COLUMNS`] are read as-is; raw
    /// collision tables are filtered to bike crashes and projected.
    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let mut dataset = Self::default();
        read_tables(path, |name, reader| dataset.ingest(name, reader))?;
        dataset.log_summary();
        Ok(dataset)
    }

    /// Same as [`load`](Self::load) for a downloaded body named `name`.
    #[tracing::instrument(skip(bytes), fields(bytes = bytes.len()))]
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self> {
        let mut dataset = Self::default();
        read_tables_from_bytes(name, bytes, |name, reader| dataset.ingest(name, reader))?;
        dataset.log_summary();
        Ok(dataset)
    }

    /// Reads a single CSV table.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut dataset = Self::default();
        let mut reader = reader;
        dataset.ingest("<reader>", &mut reader)?;
        Ok(dataset)
    }

    /// Wraps already-processed records.
    pub fn from_records(crashes: Vec<CrashRecord>) -> Self {
        let stats = CleaningStats {
            input_rows: crashes.len(),
            kept: crashes.len(),
            ..Default::default()
        };
        Self {
            crashes,
            stats,
            aligned: false,
        }
    }

    pub fn crashes(&self) -> &[CrashRecord] {
        &self.crashes
    }

    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }

    pub fn stats(&self) -> CleaningStats {
        self.stats
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    /// Projected `(x, y)` positions, or centered positions once aligned.
    pub fn points(&self) -> Vec<[f64; 2]> {
        self.crashes
            .iter()
            .map(|c| match c.centered {
                Some((x, y)) => [x, y],
                None => [c.x, c.y],
            })
            .collect()
    }

    fn ingest(&mut self, name: &str, reader: &mut dyn Read) -> Result<()> {
        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let columns = Columns::new(&headers);

        let mut table = Vec::new();
        if columns.missing(REQUIRED_COLUMNS).is_empty() {
            debug!(table = name, "Table already processed, loading as-is");
            for result in rdr.deserialize() {
                let record: CrashRecord = result?;
                table.push(record);
            }
            self.stats.input_rows += table.len();
            self.stats.kept += table.len();
        } else {
            let missing = columns.missing(RAW_COLUMNS);
            if !missing.is_empty() {
                return Err(Error::MissingColumns {
                    dataset: "NYPD crash",
                    missing: missing.into_iter().map(String::from).collect(),
                });
            }
            debug!(table = name, "Processing raw collision table");
            let mut stats = CleaningStats::default();
            for result in rdr.records() {
                let record = result?;
                stats.input_rows += 1;
                if let Some(crash) = process_row(&columns, &record, &mut stats) {
                    table.push(crash);
                }
            }
            stats.kept = table.len();
            info!(
                table = name,
                input_rows = stats.input_rows,
                bike_rows = stats.bike_rows,
                kept = stats.kept,
                "Collision table processed"
            );
            self.stats.input_rows += stats.input_rows;
            self.stats.bike_rows += stats.bike_rows;
            self.stats.missing_essentials += stats.missing_essentials;
            self.stats.zero_coordinates += stats.zero_coordinates;
            self.stats.unparsed_datetimes += stats.unparsed_datetimes;
            self.stats.kept += stats.kept;
        }

        self.crashes.extend(table);
        Ok(())
    }

    fn log_summary(&self) {
        info!(
            crashes = self.crashes.len(),
            input_rows = self.stats.input_rows,
            "Bike crash dataset loaded"
        );
    }

    /// Centers crashes on the station centroid and drops those outside the
    /// station bounding box.
    #[tracing::instrument(skip(self), fields(before = self.crashes.len()))]
    pub fn citibike_alignment(&mut self, frame: &AlignmentFrame) {
        let before = self.crashes.len();
        self.crashes.retain_mut(|crash| {
            let x = crash.x - frame.x_center;
            let y = crash.y - frame.y_center;
            crash.centered = Some((x, y));
            frame.contains(x, y)
        });
        self.aligned = true;

        info!(
            kept = self.crashes.len(),
            dropped = before - self.crashes.len(),
            "Crashes aligned to station network"
        );
    }

    /// Aggregates aligned crashes into non-empty spatio-temporal cells.
    ///
    /// Crashes whose `CRASH TIME` cannot be read as a clock time are skipped.
    ///
    /// # Errors
    ///
    /// [`Error::NotAligned`] before [`citibike_alignment`](Self::citibike_alignment),
    /// [`Error::InvalidParameter`] for a zero bin count or bin size.
    #[tracing::instrument(skip(self), fields(crashes = self.crashes.len()))]
    pub fn spatio_temporal_rasterization(&self, spec: RasterSpec) -> Result<Vec<RasterCell>> {
        if !self.aligned {
            return Err(Error::NotAligned);
        }

        let mut skipped = 0usize;
        let points: Vec<TimedPoint> = self
            .crashes
            .iter()
            .filter_map(|c| {
                let (x, y) = c.centered?;
                match clock_minutes(&c.crash_time) {
                    Some(minutes) => Some(TimedPoint { x, y, minutes }),
                    None => {
                        skipped += 1;
                        None
                    }
                }
            })
            .collect();
        if skipped > 0 {
            warn!(skipped, "Skipped crashes with unreadable CRASH TIME");
        }

        let cells = rasterize(&points, spec)?;
        info!(cells = cells.len(), points = points.len(), "Raster built");
        Ok(cells)
    }

    /// Writes the processed columns so a later [`load`](Self::load) skips processing.
    pub fn write_csv(&self, writer: impl Write) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_writer(writer);
        for crash in &self.crashes {
            wtr.serialize(crash)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn is_bike_crash(columns: &Columns, record: &StringRecord) -> bool {
    let positive = |col: &str| columns.get_f64(record, col).is_some_and(|n| n > 0.0);
    if positive(CYCLIST_INJURED) || positive(CYCLIST_KILLED) {
        return true;
    }

    VEHICLE_TYPE_COLUMNS.iter().any(|col| {
        columns.get(record, col).is_some_and(|v| {
            let v = v.to_lowercase();
            BIKE_MARKERS.iter().any(|m| v.contains(m))
        })
    })
}

fn process_row(
    columns: &Columns,
    record: &StringRecord,
    stats: &mut CleaningStats,
) -> Option<CrashRecord> {
    if !is_bike_crash(columns, record) {
        return None;
    }
    stats.bike_rows += 1;

    let essentials = (
        columns.get(record, "CRASH DATE"),
        columns.get(record, "CRASH TIME"),
        columns.get_f64(record, "LATITUDE"),
        columns.get_f64(record, "LONGITUDE"),
    );
    let (Some(date), Some(time), Some(latitude), Some(longitude)) = essentials else {
        stats.missing_essentials += 1;
        return None;
    };

    if latitude == 0.0 || longitude == 0.0 {
        stats.zero_coordinates += 1;
        return None;
    }

    let crash_datetime = parse_date_and_time(date, time);
    if crash_datetime.is_none() {
        stats.unparsed_datetimes += 1;
    }

    let (x, y) = to_web_mercator(longitude, latitude);
    Some(CrashRecord {
        crash_date: date.to_string(),
        crash_time: time.to_string(),
        latitude,
        longitude,
        crash_datetime,
        x,
        y,
        centered: None,
    })
}
