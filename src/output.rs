//! Output formatting and persistence for pipeline tables.
//!
//! Supports pretty-printing, JSON logging, CSV append and whole-table CSV
//! export. Paths ending in `.gz` are gzip-compressed.

use anyhow::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{debug, info};

use crate::modeling::density::{Grid2d, Histogram2d};
use csv::WriterBuilder;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Logs a value using Rust's debug pretty-print format.
pub fn print_pretty<T: Debug>(value: &T) {
    debug!("{:#?}", value);
}

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends a record as a row to a CSV file.
///
/// Creates the file (and its parent directories) with headers if it does not
/// already exist.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

/// Writes `rows` to a new CSV file at `path`, replacing any existing file.
///
/// Returns the number of rows written.
pub fn write_records<'a, T, I>(path: &Path, rows: I) -> Result<usize>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut count = 0;
    with_writer(path, |out| {
        let mut writer = WriterBuilder::new().from_writer(out);
        for row in rows {
            writer.serialize(row)?;
            count += 1;
        }
        writer.flush()?;
        Ok(())
    })?;
    info!(path = %path.display(), rows = count, "Table written");
    Ok(count)
}

/// Opens `path` for writing, creating parent directories, and gzip-compresses
/// everything `body` writes when the name ends in `.gz`.
pub fn with_writer<F>(path: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(File::create(path)?);

    if is_gzip(path) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        body(&mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        body(&mut file)?;
        file.flush()?;
    }
    Ok(())
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

#[derive(Serialize)]
struct GridRow {
    x: f64,
    y: f64,
    value: f64,
}

#[derive(Serialize)]
struct HistogramRow {
    x_left: f64,
    x_right: f64,
    y_left: f64,
    y_right: f64,
    value: f64,
}

/// Writes a KDE surface in long form, one `x,y,value` row per lattice point.
pub fn write_grid(path: &Path, xx: &Grid2d, yy: &Grid2d, values: &Grid2d) -> Result<usize> {
    let (rows, cols) = values.shape();
    anyhow::ensure!(
        xx.shape() == (rows, cols) && yy.shape() == (rows, cols),
        "grid shapes differ: {:?} {:?} {:?}",
        xx.shape(),
        yy.shape(),
        values.shape()
    );
    let cells: Vec<GridRow> = (0..rows)
        .flat_map(|r| (0..cols).map(move |c| (r, c)))
        .map(|(r, c)| GridRow {
            x: xx.get(r, c),
            y: yy.get(r, c),
            value: values.get(r, c),
        })
        .collect();
    write_records(path, &cells)
}

/// Writes a 2-D histogram in long form, one row per bin with its edges.
pub fn write_histogram(path: &Path, hist: &Histogram2d) -> Result<usize> {
    let (nx, ny) = hist.values.shape();
    anyhow::ensure!(
        hist.xedges.len() == nx + 1 && hist.yedges.len() == ny + 1,
        "histogram edges do not match its {nx}x{ny} bins"
    );
    let cells: Vec<HistogramRow> = (0..nx)
        .flat_map(|ix| (0..ny).map(move |iy| (ix, iy)))
        .map(|(ix, iy)| HistogramRow {
            x_left: hist.xedges[ix],
            x_right: hist.xedges[ix + 1],
            y_left: hist.yedges[iy],
            y_right: hist.yedges[iy + 1],
            value: hist.values.get(ix, iy),
        })
        .collect();
    write_records(path, &cells)
}
