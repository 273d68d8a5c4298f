//! Service configuration types.

use serde::{Deserialize, Serialize};

use crate::types::GeoPoint;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Upstream geodata mirrors and retry policy.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Area and entity cache TTLs.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Forecast weights and bounds.
    #[serde(default)]
    pub prediction: PredictionConfig,

    /// Background availability broadcast job.
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Nearby listing defaults.
    #[serde(default)]
    pub listing: ListingConfig,

    /// Seed for every random source. Entropy when unset.
    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// Facilities registered in the record store at startup.
    #[serde(default)]
    pub facilities: Vec<SeedFacility>,
}

/// Upstream mirror settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Interchangeable Overpass interpreter endpoints, tried in order.
    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<String>,

    /// Total attempts per query across all mirrors.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Timeout for a single attempt (milliseconds).
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Backoff base; attempt `i` waits `base * 2^i` before the next one.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Server-side query timeout embedded in Overpass QL (seconds).
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Cache TTLs (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_area_ttl")]
    pub area_ttl_secs: u64,

    #[serde(default = "default_entity_ttl")]
    pub entity_ttl_secs: u64,

    /// Decimal places kept when rounding coordinates into an area key.
    #[serde(default = "default_coord_precision")]
    pub coord_precision: u32,
}

/// Forecast parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Max pattern-matched records considered.
    #[serde(default = "default_pattern_limit")]
    pub pattern_limit: usize,

    /// Most recent records used for the trend (split in halves).
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,

    #[serde(default = "default_history_weight")]
    pub history_weight: f64,

    #[serde(default = "default_current_weight")]
    pub current_weight: f64,

    #[serde(default = "default_trend_weight")]
    pub trend_weight: f64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: u8,

    #[serde(default = "default_max_confidence")]
    pub max_confidence: u8,

    /// Confidence reported when no pattern-matched history exists.
    #[serde(default = "default_low_confidence")]
    pub low_confidence: u8,

    /// Max absolute random delta applied when no history exists.
    #[serde(default = "default_fallback_jitter")]
    pub fallback_jitter: i64,

    /// Horizon used when annotating listings with forecasts (minutes).
    #[serde(default = "default_minutes_ahead")]
    pub default_minutes_ahead: i64,

    /// Lifetime of a memoized forecast (seconds).
    #[serde(default = "default_prediction_ttl")]
    pub cache_ttl_secs: u64,
}

/// Broadcast job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_broadcast_interval")]
    pub interval_secs: u64,

    /// Max absolute change applied to a facility per cycle.
    #[serde(default = "default_max_delta")]
    pub max_delta: i64,

    /// Probability of capturing a history record per facility per cycle.
    #[serde(default = "default_history_probability")]
    pub history_probability: f64,

    #[serde(default)]
    pub fan_out: FanOut,
}

/// How change events are addressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    /// Every connected channel receives every change.
    #[default]
    All,
    /// Only channels subscribed to the facility (or to the wildcard).
    Subscribed,
}

/// Listing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_radius")]
    pub default_radius_m: u32,

    /// Annotate listed facilities with a forecast.
    #[serde(default = "default_true")]
    pub include_predictions: bool,
}

/// A facility declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFacility {
    pub id: String,
    pub name: String,
    pub total_spots: u32,
    #[serde(default)]
    pub available_spots: Option<u32>,
    pub lat: f64,
    pub lng: f64,
}

impl SeedFacility {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_mirrors() -> Vec<String> {
    vec![
        "https://overpass-api.de/api/interpreter".into(),
        "https://overpass.kumi.systems/api/interpreter".into(),
        "https://maps.mail.ru/osm/tools/overpass/api/interpreter".into(),
    ]
}
fn default_attempts() -> u32 {
    3
}
fn default_attempt_timeout_ms() -> u64 {
    10_000
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_query_timeout() -> u32 {
    25
}
fn default_user_agent() -> String {
    "parkwatch/0.1 (occupancy service)".into()
}
fn default_area_ttl() -> u64 {
    600
}
fn default_entity_ttl() -> u64 {
    3600
}
fn default_coord_precision() -> u32 {
    3
}
fn default_pattern_limit() -> usize {
    20
}
fn default_trend_window() -> usize {
    6
}
fn default_history_weight() -> f64 {
    0.6
}
fn default_current_weight() -> f64 {
    0.3
}
fn default_trend_weight() -> f64 {
    0.1
}
fn default_min_confidence() -> u8 {
    70
}
fn default_max_confidence() -> u8 {
    95
}
fn default_low_confidence() -> u8 {
    60
}
fn default_fallback_jitter() -> i64 {
    5
}
fn default_minutes_ahead() -> i64 {
    30
}
fn default_prediction_ttl() -> u64 {
    300
}
fn default_broadcast_interval() -> u64 {
    30
}
fn default_max_delta() -> i64 {
    3
}
fn default_history_probability() -> f64 {
    0.17
}
fn default_max_results() -> usize {
    50
}
fn default_radius() -> u32 {
    1000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mirrors: default_mirrors(),
            attempts: default_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            query_timeout_secs: default_query_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            area_ttl_secs: default_area_ttl(),
            entity_ttl_secs: default_entity_ttl(),
            coord_precision: default_coord_precision(),
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            pattern_limit: default_pattern_limit(),
            trend_window: default_trend_window(),
            history_weight: default_history_weight(),
            current_weight: default_current_weight(),
            trend_weight: default_trend_weight(),
            min_confidence: default_min_confidence(),
            max_confidence: default_max_confidence(),
            low_confidence: default_low_confidence(),
            fallback_jitter: default_fallback_jitter(),
            default_minutes_ahead: default_minutes_ahead(),
            cache_ttl_secs: default_prediction_ttl(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_broadcast_interval(),
            max_delta: default_max_delta(),
            history_probability: default_history_probability(),
            fan_out: FanOut::default(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            default_radius_m: default_radius(),
            include_predictions: true,
        }
    }
}
