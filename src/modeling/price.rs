//! Per-ride insurance pricing from predicted crash counts and station traffic.
//!
//! Risk per ride is the predicted crash count of the station's cell and
//! time-of-day bin divided by the number of rides starting or ending at that
//! station in the same bin.

use crate::datasets::citibike::CitibikeDataset;
use crate::error::{Error, Result};
use crate::modeling::linear::CrashModel;
use crate::raster::MINUTES_PER_DAY;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Tunable pricing constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingParams {
    /// Time bin width in minutes.
    pub time_bin_size: u32,
    /// Average cost of one crash.
    pub cost_per_accident: f64,
    /// Scales crash counts against observed traffic, absorbing dataset size.
    pub traffic_adjustment: f64,
}

impl Default for PricingParams {
    fn default() -> Self {
        Self {
            time_bin_size: 30,
            cost_per_accident: 5000.0,
            traffic_adjustment: 0.001,
        }
    }
}

impl PricingParams {
    pub fn validate(&self) -> Result<()> {
        if self.time_bin_size == 0 || self.time_bin_size > MINUTES_PER_DAY {
            return Err(Error::InvalidParameter(format!(
                "time_bin_size must be in 1..={MINUTES_PER_DAY}, got {}",
                self.time_bin_size
            )));
        }
        if !(self.cost_per_accident.is_finite() && self.cost_per_accident > 0.0) {
            return Err(Error::InvalidParameter("cost_per_accident must be positive".into()));
        }
        if !(self.traffic_adjustment.is_finite() && self.traffic_adjustment > 0.0) {
            return Err(Error::InvalidParameter("traffic_adjustment must be positive".into()));
        }
        Ok(())
    }
}

/// Price and the figures it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub start_station_id: String,
    pub started_at: String,
    pub time_center: f64,
    pub predicted_crash_count: f64,
    pub traffic: u64,
    pub risk_per_ride: f64,
    pub insurance_price: f64,
}

/// Prices rides with a [`CrashModel`] and the traffic observed in a trip log.
pub struct PriceCalculator<'a, M> {
    model: M,
    citibike: &'a CitibikeDataset,
    params: PricingParams,
    /// Rides starting plus rides ending, per station and time bin.
    traffic: HashMap<(&'a str, u32), u64>,
}

impl<'a, M: CrashModel> PriceCalculator<'a, M> {
    pub fn new(model: M, citibike: &'a CitibikeDataset, params: PricingParams) -> Result<Self> {
        params.validate()?;

        let bin = |dt: &NaiveDateTime| minutes_since_midnight(dt) / params.time_bin_size;
        let mut traffic: HashMap<(&'a str, u32), u64> = HashMap::new();
        for ride in citibike.rides() {
            *traffic
                .entry((ride.start_station_id.as_str(), bin(&ride.started_at)))
                .or_default() += 1;
            *traffic
                .entry((ride.end_station_id.as_str(), bin(&ride.ended_at)))
                .or_default() += 1;
        }
        debug!(keys = traffic.len(), "Traffic index built");

        Ok(Self {
            model,
            citibike,
            params,
            traffic,
        })
    }

    pub fn params(&self) -> PricingParams {
        self.params
    }

    /// Minutes since midnight.
    pub fn convert_time_to_minutes(&self, dt: &NaiveDateTime) -> u32 {
        minutes_since_midnight(dt)
    }

    /// Midpoint (in minutes) of the bin containing `minutes`.
    pub fn get_time_bin_center(&self, minutes: u32) -> f64 {
        let size = f64::from(self.params.time_bin_size);
        f64::from(minutes / self.params.time_bin_size) * size + size / 2.0
    }

    /// Rides starting or ending at `station_id` in time bin `bin`.
    pub fn traffic(&self, station_id: &str, bin: u32) -> u64 {
        self.traffic.get(&(station_id, bin)).copied().unwrap_or(0)
    }

    /// Returns `(insurance_price, risk_per_ride)` for a ride starting at
    /// `started_at` from `start_station_id`.
    pub fn predict_insurance_price(
        &self,
        started_at: &NaiveDateTime,
        start_station_id: &str,
    ) -> Result<(f64, f64)> {
        let quote = self.quote(started_at, start_station_id)?;
        Ok((quote.insurance_price, quote.risk_per_ride))
    }

    /// Full pricing breakdown for one ride.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownStation`] if the station is not in the trip log.
    pub fn quote(&self, started_at: &NaiveDateTime, start_station_id: &str) -> Result<Quote> {
        let station = self
            .citibike
            .station(start_station_id)
            .ok_or_else(|| Error::UnknownStation(start_station_id.to_string()))?;

        let minutes = self.convert_time_to_minutes(started_at);
        let time_center = self.get_time_bin_center(minutes);

        // A linear surface can dip below zero far from the data
        let predicted_crash_count = self
            .model
            .predict(station.x_centered, station.y_centered, time_center)
            .max(0.0);

        let traffic = self.traffic(start_station_id, minutes / self.params.time_bin_size);
        let risk_per_ride = if traffic > 0 {
            predicted_crash_count / traffic as f64
        } else {
            predicted_crash_count
        };
        let insurance_price =
            risk_per_ride * self.params.cost_per_accident * self.params.traffic_adjustment;

        Ok(Quote {
            start_station_id: start_station_id.to_string(),
            started_at: started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            time_center,
            predicted_crash_count,
            traffic,
            risk_per_ride,
            insurance_price,
        })
    }
}

fn minutes_since_midnight(dt: &NaiveDateTime) -> u32 {
    dt.hour() * 60 + dt.minute()
}
