//! CLI entry point for the bike insurance pricer.
//!
//! Provides subcommands for cleaning crash extracts, deriving the Citibike
//! station network, rasterizing crashes, fitting the crash-count model,
//! exporting density surfaces and pricing rides.

use anyhow::{Context, Result, bail};
use bike_insurance_pricer::{
    config::PipelineConfig,
    datasets::{citibike::CitibikeDataset, crash::BikeCrashDataset, parse_datetime},
    fetch::{APP_TOKEN_ENV, BasicClient, auth::AppToken, fetch_bytes, is_remote},
    modeling::{
        density::{DensityEstimator, Kernel},
        linear::LinearModel,
        price::{PriceCalculator, Quote},
    },
    output::{
        append_record, print_json, print_pretty, with_writer, write_grid, write_histogram,
        write_records,
    },
    raster::RasterCell,
};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "bike_insurance_pricer")]
#[command(about = "Price Citibike rides from NYPD bike-crash risk", long_about = None)]
struct Cli {
    /// JSON file with raster, density, model and pricing parameters
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce an NYPD collision extract to projected bike crashes
    CleanCrashes {
        /// Crash CSV, .csv.gz, ZIP, directory or URL
        #[arg(value_name = "FILE_OR_URL")]
        crashes: String,

        /// Trip log used to crop crashes to the station network
        #[arg(long, value_name = "FILE_OR_URL")]
        citibike: Option<String>,

        /// CSV file to write cleaned crashes to (.gz to compress)
        #[arg(short, long, default_value = "bike_crashes.csv")]
        output: PathBuf,
    },
    /// Derive the station table from a Citibike trip log
    Stations {
        /// Trip CSV, ZIP archive, directory or URL
        #[arg(value_name = "FILE_OR_URL")]
        citibike: String,

        /// CSV file to write stations to
        #[arg(short, long, default_value = "stations.csv")]
        output: PathBuf,

        /// Optional: CSV file to write incomplete trip rows to
        #[arg(long)]
        dropped: Option<PathBuf>,
    },
    /// Count aligned crashes per spatial and time-of-day cell
    Rasterize {
        #[arg(long, value_name = "FILE_OR_URL")]
        crashes: String,

        #[arg(long, value_name = "FILE_OR_URL")]
        citibike: String,

        /// CSV file to write raster cells to
        #[arg(short, long, default_value = "raster.csv")]
        output: PathBuf,

        /// Spatial bins along each axis
        #[arg(long)]
        bins: Option<usize>,

        /// Time bin width in minutes
        #[arg(long)]
        time_bin_size: Option<u32>,
    },
    /// Fit the crash-count model on a raster CSV
    Fit {
        /// Raster CSV written by `rasterize`
        #[arg(value_name = "FILE")]
        raster: PathBuf,

        /// JSON file to write the fitted model to
        #[arg(short, long, default_value = "model.json")]
        model: PathBuf,

        /// Polynomial degree (1-3)
        #[arg(long)]
        degree: Option<u32>,
    },
    /// Export crash KDE and crash-per-ride histograms as CSV grids
    Density {
        #[arg(long, value_name = "FILE_OR_URL")]
        crashes: String,

        #[arg(long, value_name = "FILE_OR_URL")]
        citibike: String,

        /// Directory to write grid CSVs to
        #[arg(short = 'd', long, default_value = "density")]
        output_dir: PathBuf,

        #[arg(long)]
        bandwidth: Option<f64>,

        /// gaussian, tophat, epanechnikov, exponential, linear or cosine
        #[arg(long)]
        kernel: Option<Kernel>,

        /// KDE lattice size along each axis
        #[arg(long)]
        grid_size: Option<usize>,

        /// Histogram bins along each axis
        #[arg(long)]
        bins: Option<usize>,
    },
    /// Price one ride, or every ride in the trip log
    Price {
        /// Trip log providing stations and traffic
        #[arg(long, value_name = "FILE_OR_URL")]
        citibike: String,

        /// Fitted model JSON
        #[arg(short, long, default_value = "model.json")]
        model: PathBuf,

        /// Start station of a single ride to price
        #[arg(long, requires = "started_at")]
        station: Option<String>,

        /// Start time of a single ride, e.g. "2023-03-01 08:07:00"
        #[arg(long, requires = "station")]
        started_at: Option<String>,

        /// CSV file of quotes: replaced when pricing the whole log, appended to for a single ride
        #[arg(short, long, default_value = "quotes.csv")]
        output: PathBuf,

        #[arg(long)]
        time_bin_size: Option<u32>,

        #[arg(long)]
        cost_per_accident: Option<f64>,

        #[arg(long)]
        traffic_adjustment: Option<f64>,
    },
}

#[derive(Serialize)]
struct ModelSummary<'a> {
    model: &'a Path,
    degree: u32,
    n_samples: usize,
    r_squared: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/bike_insurance_pricer.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("bike_insurance_pricer.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::CleanCrashes {
            crashes,
            citibike,
            output,
        } => {
            let mut crashes = load_crashes(&crashes).await?;
            if let Some(citibike) = citibike {
                let citibike = load_citibike(&citibike).await?;
                crashes.citibike_alignment(&citibike.alignment_frame());
            }
            with_writer(&output, |out| Ok(crashes.write_csv(out)?))?;
            info!(path = %output.display(), rows = crashes.len(), "Cleaned crashes written");
            print_json(&crashes.stats())?;
        }
        Commands::Stations {
            citibike,
            output,
            dropped,
        } => {
            let citibike = load_citibike(&citibike).await?;
            write_records(&output, citibike.stations())?;
            if let Some(dropped) = dropped {
                write_records(&dropped, citibike.dropped_rows())?;
            }
            info!(
                rides = citibike.rides().len(),
                dropped = citibike.dropped_rows().len(),
                stations = citibike.stations().len(),
                duration_mean = citibike.duration_mean(),
                duration_std = ?citibike.duration_std(),
                "Trip log summary"
            );
        }
        Commands::Rasterize {
            crashes,
            citibike,
            output,
            bins,
            time_bin_size,
        } => {
            if let Some(bins) = bins {
                config.raster.bins = bins;
            }
            if let Some(size) = time_bin_size {
                config.raster.time_bin_size = size;
            }
            config.validate()?;

            let (crashes, _) = load_aligned(&crashes, &citibike).await?;
            let cells = crashes.spatio_temporal_rasterization(config.raster)?;
            write_records(&output, &cells)?;
        }
        Commands::Fit {
            raster,
            model,
            degree,
        } => {
            if let Some(degree) = degree {
                config.model.degree = degree;
            }
            config.validate()?;

            let cells = read_raster(&raster)?;
            let fitted = LinearModel::fit(&cells, config.model.degree)?;
            fitted.save(&model)?;
            print_pretty(&fitted);
            print_json(&ModelSummary {
                model: &model,
                degree: fitted.degree,
                n_samples: fitted.n_samples,
                r_squared: fitted.r_squared,
            })?;
        }
        Commands::Density {
            crashes,
            citibike,
            output_dir,
            bandwidth,
            kernel,
            grid_size,
            bins,
        } => {
            if let Some(bandwidth) = bandwidth {
                config.density.bandwidth = bandwidth;
            }
            if let Some(kernel) = kernel {
                config.density.kernel = kernel;
            }
            if let Some(grid_size) = grid_size {
                config.density.grid_size = grid_size;
            }
            if let Some(bins) = bins {
                config.density.bins = bins;
            }
            config.validate()?;

            let (crashes, citibike) = load_aligned(&crashes, &citibike).await?;
            export_density(&crashes, &citibike, &config, &output_dir)?;
        }
        Commands::Price {
            citibike,
            model,
            station,
            started_at,
            output,
            time_bin_size,
            cost_per_accident,
            traffic_adjustment,
        } => {
            if let Some(size) = time_bin_size {
                config.pricing.time_bin_size = size;
            }
            if let Some(cost) = cost_per_accident {
                config.pricing.cost_per_accident = cost;
            }
            if let Some(adjustment) = traffic_adjustment {
                config.pricing.traffic_adjustment = adjustment;
            }
            config.validate()?;

            let citibike = load_citibike(&citibike).await?;
            let model = LinearModel::load(&model)
                .with_context(|| format!("failed to load model {}", model.display()))?;
            let calculator = PriceCalculator::new(model, &citibike, config.pricing)?;

            if let (Some(station), Some(started_at)) = (station, started_at) {
                let Some(started_at) = parse_datetime(&started_at) else {
                    bail!("unrecognised --started-at '{started_at}'");
                };
                let quote = calculator.quote(&started_at, &station)?;
                append_record(&output, &quote)?;
                print_json(&quote)?;
            } else {
                let quotes: Vec<Quote> = citibike
                    .rides()
                    .iter()
                    .map(|ride| calculator.quote(&ride.started_at, &ride.start_station_id))
                    .collect::<bike_insurance_pricer::Result<_>>()?;
                write_records(&output, &quotes)?;
            }
        }
    }

    Ok(())
}

/// Loads crashes from a local path or fetches them over HTTP.
#[tracing::instrument]
async fn load_crashes(source: &str) -> Result<BikeCrashDataset> {
    let crashes = if is_remote(source) {
        let bytes = download(source).await?;
        BikeCrashDataset::from_bytes(remote_name(source), &bytes)?
    } else {
        BikeCrashDataset::load(Path::new(source))?
    };
    Ok(crashes)
}

/// Loads trips from a local path or fetches them over HTTP.
#[tracing::instrument]
async fn load_citibike(source: &str) -> Result<CitibikeDataset> {
    let citibike = if is_remote(source) {
        let bytes = download(source).await?;
        CitibikeDataset::from_bytes(remote_name(source), &bytes)?
    } else {
        CitibikeDataset::load(Path::new(source))?
    };
    Ok(citibike)
}

/// Crashes cropped and centered on the station network of `citibike`.
async fn load_aligned(
    crashes: &str,
    citibike: &str,
) -> Result<(BikeCrashDataset, CitibikeDataset)> {
    let mut crashes = load_crashes(crashes).await?;
    let citibike = load_citibike(citibike).await?;
    crashes.citibike_alignment(&citibike.alignment_frame());
    if crashes.is_empty() {
        warn!("No crashes fall inside the station network");
    }
    Ok((crashes, citibike))
}

/// Downloads `url`, sending the NYC Open Data app token when one is configured.
async fn download(url: &str) -> Result<Bytes> {
    let client = BasicClient::new();
    match std::env::var(APP_TOKEN_ENV).ok().filter(|t| !t.is_empty()) {
        Some(token) => {
            let Some(client) = AppToken::socrata(client, &token) else {
                bail!("{APP_TOKEN_ENV} is not a valid header value");
            };
            fetch_bytes(&client, url).await
        }
        None => fetch_bytes(&client, url).await,
    }
}

/// Last path segment of a URL without its query, used to pick a decoder.
fn remote_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

fn read_raster(path: &Path) -> Result<Vec<RasterCell>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open raster {}", path.display()))?;
    let cells = reader
        .deserialize()
        .collect::<std::result::Result<Vec<RasterCell>, _>>()?;
    info!(path = %path.display(), cells = cells.len(), "Raster loaded");
    Ok(cells)
}

#[tracing::instrument(skip_all, fields(output_dir = %output_dir.display()))]
fn export_density(
    crashes: &BikeCrashDataset,
    citibike: &CitibikeDataset,
    config: &PipelineConfig,
    output_dir: &Path,
) -> Result<()> {
    let density = &config.density;
    let crash_kde = DensityEstimator::new(crashes.points(), density.bandwidth, density.kernel)?;
    let ride_kde = DensityEstimator::new(
        citibike.ride_start_points(),
        density.bandwidth,
        density.kernel,
    )?;

    let (xx, yy, surface) = crash_kde.evaluate_grid(density.grid_size);
    write_grid(&output_dir.join("crash_kde.csv"), &xx, &yy, &surface)?;

    let crash_hist = crash_kde.histogram2d(density.bins, false)?;
    write_histogram(&output_dir.join("crash_histogram.csv"), &crash_hist)?;

    let per_ride = DensityEstimator::normalized_histogram2d(&crash_kde, &ride_kde, density.bins)?;
    write_histogram(&output_dir.join("crashes_per_ride.csv"), &per_ride)?;

    info!(
        kernel = %density.kernel,
        bandwidth = density.bandwidth,
        crash_points = crash_kde.data().len(),
        ride_points = ride_kde.data().len(),
        max_ratio = per_ride.values.max(),
        "Density surfaces exported"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_name_strips_query() {
        assert_eq!(
            remote_name("https://data.cityofnewyork.us/api/views/h9gi-nx95/rows.csv?accessType=DOWNLOAD"),
            "rows.csv"
        );
        assert_eq!(
            remote_name("https://s3.amazonaws.com/tripdata/202303-citibike-tripdata.csv.zip"),
            "202303-citibike-tripdata.csv.zip"
        );
    }

    #[test]
    fn test_cli_parses_price_single_ride() {
        let cli = Cli::try_parse_from([
            "bike_insurance_pricer",
            "price",
            "--citibike",
            "trips.csv",
            "--station",
            "A1",
            "--started-at",
            "2023-03-01 08:07:00",
        ])
        .unwrap();
        match cli.command {
            Commands::Price {
                station,
                started_at,
                ..
            } => {
                assert_eq!(station.as_deref(), Some("A1"));
                assert_eq!(started_at.as_deref(), Some("2023-03-01 08:07:00"));
            }
            _ => panic!("expected price"),
        }
    }

    #[test]
    fn test_cli_station_requires_time() {
        let result = Cli::try_parse_from([
            "bike_insurance_pricer",
            "price",
            "--citibike",
            "trips.csv",
            "--station",
            "A1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_kernel_flag() {
        let cli = Cli::try_parse_from([
            "bike_insurance_pricer",
            "density",
            "--crashes",
            "c.csv",
            "--citibike",
            "t.csv",
            "--kernel",
            "epanechnikov",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Density {
                kernel: Some(Kernel::Epanechnikov),
                ..
            }
        ));
    }
}
