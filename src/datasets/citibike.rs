//! Citibike trip logs: cleaned rides, duration statistics and the station table.

use crate::datasets::crash::AlignmentFrame;
use crate::datasets::{Columns, datetime_format, parse_datetime};
use crate::error::{Error, Result};
use crate::geo::{planar_distance, to_web_mercator};
use crate::source::{read_tables, read_tables_from_bytes};
use crate::utility::{mean, min_max, sample_stddev};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

pub const REQUIRED_COLUMNS: &[&str] = &[
    "ride_id",
    "rideable_type",
    "started_at",
    "ended_at",
    "start_station_name",
    "start_station_id",
    "end_station_name",
    "end_station_id",
    "start_lat",
    "start_lng",
    "end_lat",
    "end_lng",
    "member_casual",
];

/// A trip-log row as published, before cleaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTrip {
    pub ride_id: Option<String>,
    pub rideable_type: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub start_station_name: Option<String>,
    pub start_station_id: Option<String>,
    pub end_station_name: Option<String>,
    pub end_station_id: Option<String>,
    pub start_lat: Option<String>,
    pub start_lng: Option<String>,
    pub end_lat: Option<String>,
    pub end_lng: Option<String>,
    pub member_casual: Option<String>,
}

/// A complete, parsed ride.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ride {
    pub ride_id: String,
    pub rideable_type: String,
    #[serde(with = "datetime_format")]
    pub started_at: NaiveDateTime,
    #[serde(with = "datetime_format")]
    pub ended_at: NaiveDateTime,
    pub start_station_name: String,
    pub start_station_id: String,
    pub end_station_name: String,
    pub end_station_id: String,
    pub start_lat: f64,
    pub start_lng: f64,
    pub end_lat: f64,
    pub end_lng: f64,
    pub member_casual: String,
    /// Seconds from `started_at` to `ended_at`.
    pub ride_duration: f64,
    pub ride_duration_normalized: f64,
    /// Projected distance between start and end station, in meters.
    pub straight_line_distance: f64,
}

impl Ride {
    fn from_raw(raw: &RawTrip) -> Option<Self> {
        let coord = |v: &Option<String>| v.as_deref()?.parse::<f64>().ok().filter(|c| c.is_finite());

        let started_at = parse_datetime(raw.started_at.as_deref()?)?;
        let ended_at = parse_datetime(raw.ended_at.as_deref()?)?;
        let ride_duration = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;

        Some(Ride {
            ride_id: raw.ride_id.clone()?,
            rideable_type: raw.rideable_type.clone()?,
            started_at,
            ended_at,
            start_station_name: raw.start_station_name.clone()?,
            start_station_id: raw.start_station_id.clone()?,
            end_station_name: raw.end_station_name.clone()?,
            end_station_id: raw.end_station_id.clone()?,
            start_lat: coord(&raw.start_lat)?,
            start_lng: coord(&raw.start_lng)?,
            end_lat: coord(&raw.end_lat)?,
            end_lng: coord(&raw.end_lng)?,
            member_casual: raw.member_casual.clone()?,
            ride_duration,
            ride_duration_normalized: 0.0,
            straight_line_distance: 0.0,
        })
    }
}

/// A dock location with usage counts and its projected position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub station_id: String,
    pub station_name: String,
    pub lat: f64,
    pub lng: f64,
    pub start_count: u64,
    pub end_count: u64,
    pub x: f64,
    pub y: f64,
    pub x_centered: f64,
    pub y_centered: f64,
}

/// Cleaned Citibike rides plus the derived station network.
#[derive(Debug, Clone)]
pub struct CitibikeDataset {
    rides: Vec<Ride>,
    dropped_rows: Vec<RawTrip>,
    stations: Vec<Station>,
    station_index: HashMap<String, usize>,
    duration_mean: f64,
    duration_std: Option<f64>,
    x_center: f64,
    y_center: f64,
}

impl CitibikeDataset {
    /// Loads trips from a CSV file, gzipped CSV, ZIP archive or directory of those.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`], [`Error::UnsupportedFormat`] and [`Error::NoCsvFiles`]
    /// from source resolution; [`Error::MissingColumns`] if some column is
    /// absent from every table. A column missing from only some tables leaves
    /// their rows incomplete, so they end up in [`dropped_rows`](Self::dropped_rows).
    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let mut tables = TripTables::default();
        read_tables(path, |name, reader| tables.read(name, reader))?;
        Self::from_raw(tables.finish()?)
    }

    /// Same as [`load`](Self::load) for a downloaded body named `name`.
    #[tracing::instrument(skip(bytes), fields(bytes = bytes.len()))]
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self> {
        let mut tables = TripTables::default();
        read_tables_from_bytes(name, bytes, |name, reader| tables.read(name, reader))?;
        Self::from_raw(tables.finish()?)
    }

    /// Reads a single CSV table.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut tables = TripTables::default();
        let mut reader = reader;
        tables.read("<reader>", &mut reader)?;
        Self::from_raw(tables.finish()?)
    }

    /// Cleans raw rows, computes duration statistics and builds the station table.
    pub fn from_raw(raw: Vec<RawTrip>) -> Result<Self> {
        let input_rows = raw.len();
        let mut rides = Vec::with_capacity(raw.len());
        let mut dropped_rows = Vec::new();

        for row in raw {
            match Ride::from_raw(&row) {
                Some(ride) => rides.push(ride),
                None => dropped_rows.push(row),
            }
        }

        if rides.is_empty() {
            return Err(Error::EmptyData(format!(
                "all {input_rows} trip rows were incomplete"
            )));
        }

        let durations: Vec<f64> = rides.iter().map(|r| r.ride_duration).collect();
        let duration_mean = mean(&durations);
        let duration_std = sample_stddev(&durations, duration_mean);
        let scale = duration_std.filter(|sd| *sd > 0.0);
        for ride in &mut rides {
            ride.ride_duration_normalized = match scale {
                Some(sd) => (ride.ride_duration - duration_mean) / sd,
                None => 0.0,
            };
        }

        let (stations, x_center, y_center) = build_stations(&rides);
        let station_index: HashMap<String, usize> = stations
            .iter()
            .enumerate()
            .map(|(i, s)| (s.station_id.clone(), i))
            .collect();

        for ride in &mut rides {
            let start = &stations[station_index[&ride.start_station_id]];
            let end = &stations[station_index[&ride.end_station_id]];
            ride.straight_line_distance = planar_distance((start.x, start.y), (end.x, end.y));
        }

        if !dropped_rows.is_empty() {
            warn!(dropped = dropped_rows.len(), "Dropped incomplete trip rows");
        }
        info!(
            input_rows,
            rides = rides.len(),
            stations = stations.len(),
            duration_mean,
            "Citibike dataset loaded"
        );

        Ok(Self {
            rides,
            dropped_rows,
            stations,
            station_index,
            duration_mean,
            duration_std,
            x_center,
            y_center,
        })
    }

    pub fn rides(&self) -> &[Ride] {
        &self.rides
    }

    pub fn dropped_rows(&self) -> &[RawTrip] {
        &self.dropped_rows
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, station_id: &str) -> Option<&Station> {
        self.station_index
            .get(station_id)
            .map(|&i| &self.stations[i])
    }

    pub fn duration_mean(&self) -> f64 {
        self.duration_mean
    }

    /// Sample standard deviation of ride durations; `None` with a single ride.
    pub fn duration_std(&self) -> Option<f64> {
        self.duration_std
    }

    pub fn x_center(&self) -> f64 {
        self.x_center
    }

    pub fn y_center(&self) -> f64 {
        self.y_center
    }

    /// `(min_x, max_x, min_y, max_y)` of the centered station coordinates.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        // from_raw guarantees at least one station
        let (min_x, max_x) = min_max(self.stations.iter().map(|s| s.x_centered)).unwrap_or_default();
        let (min_y, max_y) = min_max(self.stations.iter().map(|s| s.y_centered)).unwrap_or_default();
        (min_x, max_x, min_y, max_y)
    }

    /// Centroid and centered bounding box of the station network.
    pub fn alignment_frame(&self) -> AlignmentFrame {
        let (min_x, max_x, min_y, max_y) = self.bounds();
        AlignmentFrame {
            x_center: self.x_center,
            y_center: self.y_center,
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    /// Centered positions of every ride start, the exposure denominator for density ratios.
    pub fn ride_start_points(&self) -> Vec<[f64; 2]> {
        self.rides
            .iter()
            .filter_map(|r| self.station(&r.start_station_id))
            .map(|s| [s.x_centered, s.y_centered])
            .collect()
    }
}

/// Rows of every trip table read so far, concatenated.
///
/// Monthly logs changed schema over the years, so a required column may be
/// absent from some tables. Those rows read with the field as `None`; only a
/// column missing from every table rejects the input.
#[derive(Default)]
struct TripTables {
    rows: Vec<RawTrip>,
    /// Required columns absent from all tables read so far.
    absent: Option<Vec<&'static str>>,
}

impl TripTables {
    fn read(&mut self, name: &str, reader: &mut dyn Read) -> Result<()> {
        let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
        let columns = Columns::new(rdr.headers()?);

        let missing = columns.missing(REQUIRED_COLUMNS);
        if !missing.is_empty() {
            warn!(table = name, ?missing, "Trip table lacks required columns");
        }

        let mut table = Vec::new();
        for result in rdr.deserialize() {
            let row: RawTrip = result?;
            table.push(row);
        }
        debug!(table = name, rows = table.len(), "Trip table read");
        self.rows.extend(table);

        self.absent = Some(match self.absent.take() {
            None => missing,
            Some(absent) => absent.into_iter().filter(|c| missing.contains(c)).collect(),
        });
        Ok(())
    }

    fn finish(self) -> Result<Vec<RawTrip>> {
        let absent = self.absent.unwrap_or_default();
        if !absent.is_empty() {
            return Err(Error::MissingColumns {
                dataset: "Citibike",
                missing: absent.into_iter().map(String::from).collect(),
            });
        }
        Ok(self.rows)
    }
}

/// Unique start stations then unique end stations, first occurrence winning.
fn build_stations(rides: &[Ride]) -> (Vec<Station>, f64, f64) {
    let mut start_counts: HashMap<&str, u64> = HashMap::new();
    let mut end_counts: HashMap<&str, u64> = HashMap::new();
    for ride in rides {
        *start_counts.entry(&ride.start_station_id).or_default() += 1;
        *end_counts.entry(&ride.end_station_id).or_default() += 1;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut stations = Vec::new();
    let starts = rides
        .iter()
        .map(|r| (&r.start_station_id, &r.start_station_name, r.start_lat, r.start_lng));
    let ends = rides
        .iter()
        .map(|r| (&r.end_station_id, &r.end_station_name, r.end_lat, r.end_lng));

    for (id, name, lat, lng) in starts.chain(ends) {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let (x, y) = to_web_mercator(lng, lat);
        stations.push(Station {
            station_id: id.clone(),
            station_name: name.clone(),
            lat,
            lng,
            start_count: start_counts.get(id.as_str()).copied().unwrap_or(0),
            end_count: end_counts.get(id.as_str()).copied().unwrap_or(0),
            x,
            y,
            x_centered: 0.0,
            y_centered: 0.0,
        });
    }

    let x_center = mean(&stations.iter().map(|s| s.x).collect::<Vec<_>>());
    let y_center = mean(&stations.iter().map(|s| s.y).collect::<Vec<_>>());
    for station in &mut stations {
        station.x_centered = station.x - x_center;
        station.y_centered = station.y - y_center;
    }

    (stations, x_center, y_center)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIPS: &str = "\
ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng,member_casual
1,electric_bike,2023-01-01 08:00:00,2023-01-01 08:15:00,Station A,A1,Station A,A1,40.7128,-74.0060,40.7128,-74.0060,member
2,classic_bike,2023-01-01 09:00:00,2023-01-01 09:20:00,Station B,B1,Station B,B1,0,-74.0050,0,-74.0050,casual
3,classic_bike,2023-01-01 10:00:00,2023-01-01 10:20:00,Station C,C1,Station C,,40.7148,-74.0030,40.7148,-74.0030,member
";

    fn dataset() -> CitibikeDataset {
        CitibikeDataset::from_reader(TRIPS.as_bytes()).unwrap()
    }

    #[test]
    fn test_missing_columns() {
        let err = CitibikeDataset::from_reader("ride_id,started_at\n1,2023-01-01 08:00:00\n".as_bytes())
            .unwrap_err();
        match err {
            Error::MissingColumns { dataset, missing } => {
                assert_eq!(dataset, "Citibike");
                assert!(missing.contains(&"ended_at".to_string()));
                assert!(!missing.contains(&"ride_id".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_column_missing_from_one_table_drops_its_rows() {
        let legacy = "\
ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng
9,classic_bike,2020-12-31 23:00:00,2020-12-31 23:10:00,Station A,A1,Station A,A1,40.7128,-74.0060,40.7128,-74.0060
";
        let mut tables = TripTables::default();
        tables.read("current", &mut TRIPS.as_bytes()).unwrap();
        tables.read("legacy", &mut legacy.as_bytes()).unwrap();

        let data = CitibikeDataset::from_raw(tables.finish().unwrap()).unwrap();
        assert_eq!(data.rides().len(), 2);
        assert_eq!(data.dropped_rows().len(), 2);
        let legacy_row = &data.dropped_rows()[1];
        assert_eq!(legacy_row.ride_id.as_deref(), Some("9"));
        assert_eq!(legacy_row.member_casual, None);
    }

    #[test]
    fn test_column_missing_from_every_table() {
        let mut tables = TripTables::default();
        tables.read("a", &mut "ride_id,ended_at\n1,x\n".as_bytes()).unwrap();
        tables.read("b", &mut "ride_id,started_at\n2,y\n".as_bytes()).unwrap();
        match tables.finish().unwrap_err() {
            Error::MissingColumns { missing, .. } => {
                assert!(missing.contains(&"member_casual".to_string()));
                assert!(!missing.contains(&"started_at".to_string()));
                assert!(!missing.contains(&"ended_at".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_dropped_rows() {
        let data = dataset();
        assert_eq!(data.dropped_rows().len(), 1);
        assert_eq!(data.rides().len() + data.dropped_rows().len(), 3);
        assert_eq!(data.dropped_rows()[0].ride_id.as_deref(), Some("3"));
    }

    #[test]
    fn test_unparsable_timestamp_is_dropped() {
        let trips = TRIPS.replace("2023-01-01 09:20:00", "soon");
        let data = CitibikeDataset::from_reader(trips.as_bytes()).unwrap();
        assert_eq!(data.rides().len(), 1);
        assert_eq!(data.dropped_rows().len(), 2);
    }

    #[test]
    fn test_duration_calculation() {
        let data = dataset();
        assert!((data.rides()[0].ride_duration - 900.0).abs() < 1e-9);
        assert!((data.rides()[1].ride_duration - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_statistics() {
        let data = dataset();
        assert!((data.duration_mean() - 1050.0).abs() < 1e-9);
        let sd = data.duration_std().unwrap();
        assert!((sd - 212.132_034).abs() < 1e-5);

        let z = data.rides()[0].ride_duration_normalized;
        assert!((z - (900.0 - 1050.0) / sd).abs() < 1e-9);
    }

    #[test]
    fn test_single_ride_normalizes_to_zero() {
        let single: String = TRIPS.lines().take(2).collect::<Vec<_>>().join("\n");
        let data = CitibikeDataset::from_reader(single.as_bytes()).unwrap();
        assert!(data.duration_std().is_none());
        assert_eq!(data.rides()[0].ride_duration_normalized, 0.0);
    }

    #[test]
    fn test_all_rows_incomplete() {
        let header = TRIPS.lines().next().unwrap();
        let trips = format!("{header}\n,,,,,,,,,,,,\n");
        let err = CitibikeDataset::from_reader(trips.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::EmptyData(_)));
    }

    #[test]
    fn test_stations() {
        let data = dataset();
        let ids: Vec<&str> = data.stations().iter().map(|s| s.station_id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "B1"]);

        let a1 = data.station("A1").unwrap();
        assert_eq!(a1.station_name, "Station A");
        assert_eq!(a1.start_count, 1);
        assert_eq!(a1.end_count, 1);
        assert!(data.station("C1").is_none());
    }

    #[test]
    fn test_end_only_station_has_zero_starts() {
        let header = TRIPS.lines().next().unwrap();
        let trips = format!(
            "{header}\n\
             1,classic_bike,2023-01-01 08:00:00,2023-01-01 08:15:00,Station A,A1,Station Z,Z9,40.7128,-74.0060,40.7300,-73.9900,member\n"
        );
        let data = CitibikeDataset::from_reader(trips.as_bytes()).unwrap();
        let ids: Vec<&str> = data.stations().iter().map(|s| s.station_id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "Z9"]);

        let z9 = data.station("Z9").unwrap();
        assert_eq!(z9.start_count, 0);
        assert_eq!(z9.end_count, 1);
        assert_eq!(z9.lat, 40.73);
        assert_eq!(data.station("A1").unwrap().end_count, 0);
    }

    #[test]
    fn test_station_center_and_centered_values() {
        let data = dataset();
        let xs: Vec<f64> = data.stations().iter().map(|s| s.x).collect();
        let ys: Vec<f64> = data.stations().iter().map(|s| s.y).collect();
        assert!((data.x_center() - mean(&xs)).abs() < 1e-6);
        assert!((data.y_center() - mean(&ys)).abs() < 1e-6);

        for s in data.stations() {
            assert!((s.x_centered - (s.x - data.x_center())).abs() < 1e-6);
            assert!((s.y_centered - (s.y - data.y_center())).abs() < 1e-6);
        }
    }

    #[test]
    fn test_alignment_frame_bounds_stations() {
        let data = dataset();
        let frame = data.alignment_frame();
        for s in data.stations() {
            assert!(s.x_centered >= frame.min_x && s.x_centered <= frame.max_x);
            assert!(s.y_centered >= frame.min_y && s.y_centered <= frame.max_y);
        }
    }

    #[test]
    fn test_straight_line_distance() {
        let header = TRIPS.lines().next().unwrap();
        let trips = format!(
            "{header}\n\
             1,classic_bike,2023-01-01 08:00:00,2023-01-01 08:15:00,Station A,A1,Station Z,Z9,40.7128,-74.0060,40.7300,-73.9900,member\n\
             2,classic_bike,2023-01-01 09:00:00,2023-01-01 09:15:00,Station A,A1,Station A,A1,40.7128,-74.0060,40.7128,-74.0060,member\n"
        );
        let data = CitibikeDataset::from_reader(trips.as_bytes()).unwrap();
        let a1 = data.station("A1").unwrap();
        let z9 = data.station("Z9").unwrap();
        let expected = planar_distance((a1.x, a1.y), (z9.x, z9.y));

        assert!(expected > 1000.0);
        assert!((data.rides()[0].straight_line_distance - expected).abs() < 1e-6);
        assert_eq!(data.rides()[1].straight_line_distance, 0.0);
    }
}
