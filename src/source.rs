//! Resolution of input locations into CSV tables.
//!
//! Trip logs are published as monthly ZIP archives (sometimes nested inside a
//! yearly archive) and crash extracts as plain or gzipped CSV. Every readable
//! table is handed to a visitor as a streaming reader so nothing is extracted
//! to disk.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How a file's bytes must be decoded to reach CSV text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Csv,
    GzipCsv,
    Zip,
}

impl SourceKind {
    /// Classifies a file name by extension, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".csv") {
            Some(SourceKind::Csv)
        } else if lower.ends_with(".csv.gz") {
            Some(SourceKind::GzipCsv)
        } else if lower.ends_with(".zip") {
            Some(SourceKind::Zip)
        } else {
            None
        }
    }
}

/// Calls `visit` once per CSV table found at `path`, returning the number of tables.
///
/// `path` may be a `.csv`, `.csv.gz` or `.zip` file, or a directory that is
/// searched recursively. In directory mode, tables that fail to decode are
/// logged and skipped; other visitor errors abort the walk.
///
/// # Errors
///
/// [`Error::NotFound`] if the path does not exist, [`Error::UnsupportedFormat`]
/// for a file with an unknown extension, [`Error::NoCsvFiles`] if nothing was read.
pub fn read_tables<F>(path: &Path, mut visit: F) -> Result<usize>
where
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    let display = path.display().to_string();
    if !path.exists() {
        return Err(Error::NotFound(display));
    }

    let count = if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, &mut files)?;

        let mut count = 0;
        for file in files {
            let name = file.display().to_string();
            let Some(kind) = SourceKind::from_name(&name) else {
                continue;
            };
            match read_file(&file, kind, &mut visit) {
                Ok(n) => count += n,
                Err(e @ (Error::Csv(_) | Error::Io(_) | Error::Zip(_))) => {
                    warn!(file = %name, error = %e, "Skipping unreadable input file");
                }
                Err(e) => return Err(e),
            }
        }
        count
    } else {
        let kind = SourceKind::from_name(&display)
            .ok_or_else(|| Error::UnsupportedFormat(display.clone()))?;
        read_file(path, kind, &mut visit)?
    };

    if count == 0 {
        return Err(Error::NoCsvFiles(display));
    }
    Ok(count)
}

/// Like [`read_tables`] for an in-memory download, classified by `name`.
///
/// Names without a recognised extension are treated as plain CSV, since
/// open-data export endpoints rarely end in `.csv`.
pub fn read_tables_from_bytes<F>(name: &str, bytes: &[u8], mut visit: F) -> Result<usize>
where
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    let kind = SourceKind::from_name(name).unwrap_or(SourceKind::Csv);
    let count = read_reader(name, Cursor::new(bytes), kind, &mut visit)?;
    if count == 0 {
        return Err(Error::NoCsvFiles(name.to_string()));
    }
    Ok(count)
}

fn read_file<F>(path: &Path, kind: SourceKind, visit: &mut F) -> Result<usize>
where
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    let name = path.display().to_string();
    debug!(file = %name, ?kind, "Opening input file");
    let file = BufReader::new(File::open(path)?);
    read_reader(&name, file, kind, visit)
}

fn read_reader<R, F>(name: &str, mut reader: R, kind: SourceKind, visit: &mut F) -> Result<usize>
where
    R: Read + Seek,
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    match kind {
        SourceKind::Csv => {
            visit(name, &mut reader)?;
            Ok(1)
        }
        SourceKind::GzipCsv => {
            let mut decoder = GzDecoder::new(reader);
            visit(name, &mut decoder)?;
            Ok(1)
        }
        SourceKind::Zip => read_archive(name, reader, visit),
    }
}

fn read_archive<R, F>(name: &str, reader: R, visit: &mut F) -> Result<usize>
where
    R: Read + Seek,
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    let mut archive = zip::ZipArchive::new(reader)?;
    let mut count = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = format!("{}!{}", name, entry.name());

        // macOS archivers add resource-fork shadows of every member
        if entry.is_dir() || entry.name().starts_with("__MACOSX/") {
            continue;
        }

        match SourceKind::from_name(entry.name()) {
            Some(SourceKind::Csv) => {
                visit(&entry_name, &mut entry)?;
                count += 1;
            }
            Some(SourceKind::GzipCsv) => {
                let mut decoder = GzDecoder::new(&mut entry);
                visit(&entry_name, &mut decoder)?;
                count += 1;
            }
            Some(SourceKind::Zip) => {
                let mut nested = Vec::new();
                entry.read_to_end(&mut nested)?;
                drop(entry);
                count += read_archive(&entry_name, Cursor::new(nested), visit)?;
            }
            None => debug!(entry = %entry_name, "Ignoring non-CSV archive member"),
        }
    }

    Ok(count)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn collect(path: &Path) -> Result<Vec<(String, String)>> {
        let mut tables = Vec::new();
        read_tables(path, |name, reader| {
            let mut text = String::new();
            reader.read_to_string(&mut text)?;
            tables.push((name.to_string(), text));
            Ok(())
        })?;
        Ok(tables)
    }

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(SourceKind::from_name("a.CSV"), Some(SourceKind::Csv));
        assert_eq!(SourceKind::from_name("a.csv.gz"), Some(SourceKind::GzipCsv));
        assert_eq!(SourceKind::from_name("202401-citibike-tripdata.zip"), Some(SourceKind::Zip));
        assert_eq!(SourceKind::from_name("notes.txt"), None);
    }

    #[test]
    fn test_missing_path() {
        let err = collect(Path::new("non_existent_file.csv")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "Not a CSV file").unwrap();
        let err = collect(&path).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_gzip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashes.csv.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"a,b\n1,2\n").unwrap();
        encoder.finish().unwrap();

        let tables = collect(&path).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].1, "a,b\n1,2\n");
    }

    #[test]
    fn test_zip_skips_macos_shadows_and_reads_nested() {
        let dir = tempfile::tempdir().unwrap();

        let inner_path = dir.path().join("inner.zip");
        write_zip(&inner_path, &[("202401.csv", b"a\n1\n")]);
        let inner = fs::read(&inner_path).unwrap();
        fs::remove_file(&inner_path).unwrap();

        let outer = dir.path().join("2024-citibike-tripdata.zip");
        write_zip(
            &outer,
            &[
                ("202402.csv", b"a\n2\n"),
                ("__MACOSX/._202402.csv", b"junk"),
                ("readme.txt", b"hello"),
                ("202401.zip", &inner),
            ],
        );

        let tables = collect(&outer).unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables.iter().any(|(_, text)| text == "a\n1\n"));
        assert!(tables.iter().any(|(_, text)| text == "a\n2\n"));
    }

    #[test]
    fn test_directory_walk_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2024/01")).unwrap();
        fs::write(dir.path().join("a.csv"), "x\n1\n").unwrap();
        fs::write(dir.path().join("2024/01/b.csv"), "x\n2\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let tables = collect(dir.path()).unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = collect(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NoCsvFiles(_)));
    }

    #[test]
    fn test_directory_skips_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.zip"), "not a zip").unwrap();
        fs::write(dir.path().join("ok.csv"), "x\n1\n").unwrap();

        let tables = collect(dir.path()).unwrap();
        assert_eq!(tables.len(), 1);
    }

    #[test]
    fn test_bytes_default_to_csv() {
        let mut seen = 0;
        let count = read_tables_from_bytes("rows.csv?accessType=DOWNLOAD", b"a\n1\n", |_, r| {
            let mut text = String::new();
            r.read_to_string(&mut text)?;
            assert_eq!(text, "a\n1\n");
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, 1);
    }
}
