//! Domain types shared across parkwatch.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Event name carried by every availability change pushed to observers.
pub const AVAILABILITY_EVENT: &str = "availability:update";

/// Provenance prefix for facilities sourced from OpenStreetMap.
pub const OSM_ID_PREFIX: &str = "osm_";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ── Facility ──────────────────────────────────────────────────────────

/// A point on the globe, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos()
                * other.lat.to_radians().cos()
                * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// A single bay sensor reading attached to an availability update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor_id: String,
    pub occupied: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// A trackable parking area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facility {
    pub id: String,
    pub name: String,
    pub total_spots: u32,
    pub available_spots: u32,
    pub location: GeoPoint,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub predicted_spots: Option<u32>,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensors: Vec<SensorReading>,
}

impl Facility {
    /// Fraction of occupied spots, in `[0, 1]`.
    pub fn occupancy_rate(&self) -> f64 {
        occupancy_rate(self.total_spots, self.available_spots)
    }

    /// Set the available count, clamped to `[0, total]`.
    pub fn set_available(&mut self, available: i64, at: DateTime<Utc>) {
        self.available_spots = clamp_spots(available, self.total_spots);
        self.last_update = at;
    }
}

/// Payload for registering a facility directly in the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFacility {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub total_spots: u32,
    #[serde(default)]
    pub available_spots: Option<u32>,
    pub location: GeoPoint,
}

/// Clamp a signed spot count into `[0, total]`.
pub fn clamp_spots(value: i64, total: u32) -> u32 {
    value.clamp(0, i64::from(total)) as u32
}

pub fn occupancy_rate(total: u32, available: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    f64::from(total.saturating_sub(available)) / f64::from(total)
}

// ── History ───────────────────────────────────────────────────────────

/// Immutable time-stamped occupancy observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRecord {
    pub id: String,
    pub facility_id: String,
    pub timestamp: DateTime<Utc>,
    pub available_spots: u32,
    pub occupancy_rate: f64,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub hour: u8,
    pub is_holiday: bool,
}

impl HistoricalRecord {
    /// Capture the facility's current state at `at`.
    pub fn capture(id: String, facility: &Facility, at: DateTime<Utc>) -> Self {
        let (day_of_week, hour) = day_and_hour(at);
        Self {
            id,
            facility_id: facility.id.clone(),
            timestamp: at,
            available_spots: facility.available_spots,
            occupancy_rate: facility.occupancy_rate(),
            day_of_week,
            hour,
            is_holiday: is_holiday(at.date_naive()),
        }
    }
}

/// Day-of-week (Sunday = 0) and hour-of-day, both in UTC.
pub fn day_and_hour(at: DateTime<Utc>) -> (u8, u8) {
    (
        at.weekday().num_days_from_sunday() as u8,
        at.hour() as u8,
    )
}

/// Fixed-date public holidays.
pub fn is_holiday(date: NaiveDate) -> bool {
    matches!(
        (date.month(), date.day()),
        (1, 1) | (5, 1) | (7, 4) | (11, 11) | (12, 25) | (12, 26) | (12, 31)
    )
}

// ── Predictions ───────────────────────────────────────────────────────

/// Raw engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub predicted_available: u32,
    pub confidence: u8,
}

/// Forecast returned to callers of `predict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub facility_id: String,
    pub predicted_spots: u32,
    pub confidence: u8,
    pub predicted_for: DateTime<Utc>,
}

/// Store-backed memo of a computed forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionCacheEntry {
    pub facility_id: String,
    /// Target time floored to the hour.
    pub window_start: DateTime<Utc>,
    pub predicted_spots: u32,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PredictionCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Floor a timestamp to the start of its hour.
pub fn hour_window(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

// ── Broadcast ─────────────────────────────────────────────────────────

/// Change pushed to observers after every availability mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub facility_id: String,
    pub available_spots: u32,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn from_facility(facility: &Facility) -> Self {
        Self {
            facility_id: facility.id.clone(),
            available_spots: facility.available_spots,
            timestamp: facility.last_update,
        }
    }
}

// ── Stats ─────────────────────────────────────────────────────────────

/// Aggregate view over all stored facilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityStats {
    pub count: usize,
    pub total_spots: u64,
    pub total_available: u64,
    /// Percentage of occupied spots across all facilities.
    pub avg_occupancy: f64,
}

impl FacilityStats {
    pub fn from_facilities(facilities: &[Facility]) -> Self {
        let total_spots: u64 = facilities.iter().map(|f| u64::from(f.total_spots)).sum();
        let total_available: u64 = facilities
            .iter()
            .map(|f| u64::from(f.available_spots))
            .sum();
        let avg_occupancy = if total_spots == 0 {
            0.0
        } else {
            (total_spots - total_available) as f64 / total_spots as f64 * 100.0
        };

        Self {
            count: facilities.len(),
            total_spots,
            total_available,
            avg_occupancy,
        }
    }
}
