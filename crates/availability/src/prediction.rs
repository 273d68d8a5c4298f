//! Short-horizon availability forecasts.
//!
//! Blends the mean of past observations taken at the same weekday and hour
//! as the target time with the current count and a short-term trend.
//! Confidence falls with the spread of those observations and is kept in
//! a fixed band; with no matching history the forecast is the current
//! count nudged by a small random delta at a fixed low confidence.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use common::config::PredictionConfig;
use common::{clamp_spots, day_and_hour, Error, Facility, Prediction, Result};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

use crate::store::{HistoryQuery, RecordStore};

pub struct PredictionEngine {
    store: Arc<dyn RecordStore>,
    config: PredictionConfig,
    rng: Mutex<StdRng>,
}

impl PredictionEngine {
    pub fn new(store: Arc<dyn RecordStore>, config: PredictionConfig, rng: StdRng) -> Self {
        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Forecast for a stored facility `minutes_ahead` from now.
    pub async fn predict(&self, facility_id: &str, minutes_ahead: i64) -> Result<Prediction> {
        self.predict_at(facility_id, minutes_ahead, Utc::now()).await
    }

    pub async fn predict_at(
        &self,
        facility_id: &str,
        minutes_ahead: i64,
        now: DateTime<Utc>,
    ) -> Result<Prediction> {
        let facility = self
            .store
            .find_facility(facility_id)
            .await?
            .ok_or_else(|| Error::FacilityNotFound(facility_id.to_string()))?;
        self.predict_for(&facility, minutes_ahead, now).await
    }

    /// Forecast from an already loaded facility state.
    pub async fn predict_for(
        &self,
        facility: &Facility,
        minutes_ahead: i64,
        now: DateTime<Utc>,
    ) -> Result<Prediction> {
        let target = now + Duration::minutes(minutes_ahead);
        let (day, hour) = day_and_hour(target);

        let matched = self
            .store
            .find_records(&HistoryQuery::at_slot(
                &facility.id,
                day,
                hour,
                self.config.pattern_limit,
            ))
            .await?;

        if matched.is_empty() {
            debug!("{}: no history for day={} hour={}", facility.id, day, hour);
            return Ok(self.low_confidence(facility));
        }

        let recent = self
            .store
            .find_records(&HistoryQuery::recent(&facility.id, self.config.trend_window))
            .await?;

        let matched: Vec<u32> = matched.iter().map(|r| r.available_spots).collect();
        let recent: Vec<u32> = recent.iter().map(|r| r.available_spots).collect();
        let prediction = blend(&self.config, facility, &matched, &recent);

        debug!(
            "{}: matched={} predicted={} confidence={}",
            facility.id,
            matched.len(),
            prediction.predicted_available,
            prediction.confidence
        );
        Ok(prediction)
    }

    fn low_confidence(&self, facility: &Facility) -> Prediction {
        let jitter = self.config.fallback_jitter.abs();
        let delta = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(-jitter..=jitter);

        Prediction {
            predicted_available: clamp_spots(
                i64::from(facility.available_spots) + delta,
                facility.total_spots,
            ),
            confidence: self.config.low_confidence,
        }
    }
}

/// Pattern-matched forecast.
///
/// `matched` are available counts at the target slot; `recent` are the
/// latest counts overall, newest first.
pub fn blend(
    config: &PredictionConfig,
    facility: &Facility,
    matched: &[u32],
    recent: &[u32],
) -> Prediction {
    let avg = mean(matched);
    let trend = trend(recent, config.trend_window);
    let current = f64::from(facility.available_spots);

    let raw = config.history_weight * avg + config.current_weight * current
        + config.trend_weight * trend;
    let predicted_available = clamp_spots(raw.round() as i64, facility.total_spots);

    let confidence = if facility.total_spots == 0 {
        config.min_confidence
    } else {
        let spread = std_dev(matched) / f64::from(facility.total_spots) * 100.0;
        (100.0 - spread)
            .clamp(f64::from(config.min_confidence), f64::from(config.max_confidence))
            .round() as u8
    };

    Prediction {
        predicted_available,
        confidence,
    }
}

/// Mean of the newest half minus mean of the older half. Zero until a full
/// window of observations exists.
fn trend(recent: &[u32], window: usize) -> f64 {
    if window < 2 || recent.len() < window {
        return 0.0;
    }
    let half = window / 2;
    mean(&recent[..half]) - mean(&recent[half..window])
}

fn mean(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values
        .iter()
        .map(|&v| (f64::from(v) - m).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}
