//! Request-facing facade over cache, mirrors, store and forecasts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{
    hour_window, ChangeEvent, Error, Facility, FacilityStats, GeoPoint, HistoricalRecord,
    NewFacility, PredictionCacheEntry, PredictionResult, Result, SensorReading, ServiceConfig,
};
use overpass_client::{area_query, element_query, parse_element_id, transform, MirrorClient};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{AreaKey, TieredCache};
use crate::prediction::PredictionEngine;
use crate::store::{HistoryQuery, RecordStore};
use crate::subscriptions::{Broadcaster, Scope};

const MAX_HISTORY_LIMIT: usize = 500;
const MAX_MINUTES_AHEAD: i64 = 7 * 24 * 60;
const MAX_RADIUS_M: u32 = 50_000;

pub struct FacilityService {
    store: Arc<dyn RecordStore>,
    cache: Arc<TieredCache>,
    client: MirrorClient,
    engine: Arc<PredictionEngine>,
    broadcaster: Arc<dyn Broadcaster>,
    config: ServiceConfig,
}

/// Prefer live stored state for facilities the store also tracks.
fn reconcile(facilities: Vec<Facility>, stored: &HashMap<String, Facility>) -> Vec<Facility> {
    facilities
        .into_iter()
        .map(|mut f| {
            if let Some(live) = stored.get(&f.id) {
                f.total_spots = live.total_spots;
                f.available_spots = live.available_spots;
                f.last_update = live.last_update;
                f.sensors = live.sensors.clone();
            }
            f
        })
        .collect()
}

fn validate_coordinates(lat: f64, lng: f64) -> Result<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(Error::Validation(format!("latitude {lat} out of range")));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(Error::Validation(format!("longitude {lng} out of range")));
    }
    Ok(())
}

impl FacilityService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<TieredCache>,
        client: MirrorClient,
        engine: Arc<PredictionEngine>,
        broadcaster: Arc<dyn Broadcaster>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            cache,
            client,
            engine,
            broadcaster,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    // ── Listing ───────────────────────────────────────────────────────

    /// Facilities within `radius_m` of a point.
    ///
    /// Served from the area cache when fresh; otherwise fetched from the
    /// mirrors. When every mirror fails, locally stored facilities in the
    /// same radius are returned instead, and the upstream error surfaces
    /// only if there are none.
    pub async fn list_nearby(
        &self,
        lat: f64,
        lng: f64,
        radius_m: Option<u32>,
    ) -> Result<Vec<Facility>> {
        validate_coordinates(lat, lng)?;
        let radius = radius_m.unwrap_or(self.config.listing.default_radius_m);
        if radius == 0 || radius > MAX_RADIUS_M {
            return Err(Error::Validation(format!(
                "radius must be in 1..={MAX_RADIUS_M} meters"
            )));
        }

        let key = AreaKey::new(lat, lng, radius, self.config.cache.coord_precision);
        let facilities = match self.cache.get_area(&key) {
            Some(hit) => {
                debug!("Area cache hit ({} facilities)", hit.len());
                hit
            }
            None => match self.fetch_area(lat, lng, radius, key).await {
                Ok(fetched) => fetched,
                Err(Error::UpstreamUnavailable(reason)) => {
                    warn!("Upstream unavailable, serving stored facilities: {}", reason);
                    let local = self.stored_within(GeoPoint::new(lat, lng), radius).await?;
                    if local.is_empty() {
                        return Err(Error::UpstreamUnavailable(reason));
                    }
                    local
                }
                Err(e) => return Err(e),
            },
        };

        let stored: HashMap<String, Facility> = self
            .store
            .find_all_facilities()
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();
        let mut facilities = reconcile(facilities, &stored);
        if self.config.listing.include_predictions {
            self.annotate(&mut facilities, &stored).await;
        }
        Ok(facilities)
    }

    async fn fetch_area(
        &self,
        lat: f64,
        lng: f64,
        radius: u32,
        key: AreaKey,
    ) -> Result<Vec<Facility>> {
        let query = area_query(lat, lng, radius, self.client.query_timeout_secs());
        let response = self.client.fetch_default(&query).await?;

        let mut facilities = transform(&response.elements, GeoPoint::new(lat, lng), Utc::now());
        facilities.truncate(self.config.listing.max_results);
        info!(
            "Fetched {} facilities near ({:.4},{:.4}) r={}m",
            facilities.len(),
            lat,
            lng,
            radius
        );

        self.cache.put_area(key, facilities.clone());
        Ok(facilities)
    }

    async fn stored_within(&self, center: GeoPoint, radius: u32) -> Result<Vec<Facility>> {
        let mut nearby: Vec<(f64, Facility)> = self
            .store
            .find_all_facilities()
            .await?
            .into_iter()
            .map(|f| (center.distance_m(&f.location), f))
            .filter(|(d, _)| *d <= f64::from(radius))
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(nearby
            .into_iter()
            .take(self.config.listing.max_results)
            .map(|(_, f)| f)
            .collect())
    }

    /// Forecasts are attached only to facilities the store tracks.
    async fn annotate(&self, facilities: &mut [Facility], stored: &HashMap<String, Facility>) {
        let minutes = self.config.prediction.default_minutes_ahead;
        let now = Utc::now();
        for facility in facilities.iter_mut().filter(|f| stored.contains_key(&f.id)) {
            match self.forecast(facility, minutes, now).await {
                Ok(result) => {
                    facility.predicted_spots = Some(result.predicted_spots);
                    facility.confidence = Some(result.confidence);
                }
                Err(e) => debug!("No forecast for {}: {}", facility.id, e),
            }
        }
    }

    // ── Single facility ───────────────────────────────────────────────

    /// Resolve one facility: entity cache, then the store, then the area
    /// snapshot index, then an id-scoped upstream query. The answer is
    /// written to the entity cache.
    pub async fn get_by_id(&self, id: &str) -> Result<Facility> {
        if let Some(hit) = self.cache.get_facility(id) {
            debug!("Entity cache hit: {}", id);
            return Ok(hit);
        }

        let facility = match self.store.find_facility(id).await? {
            Some(stored) => stored,
            None => match self.cache.lookup_indexed(id) {
                Some(indexed) => indexed,
                None => self.fetch_single(id).await?,
            },
        };

        self.cache.put_facility(facility.clone());
        Ok(facility)
    }

    async fn fetch_single(&self, id: &str) -> Result<Facility> {
        let element_id =
            parse_element_id(id).ok_or_else(|| Error::FacilityNotFound(id.to_string()))?;
        let query = element_query(element_id, self.client.query_timeout_secs());
        let response = self.client.fetch_default(&query).await?;

        let fallback = GeoPoint::new(0.0, 0.0);
        transform(&response.elements, fallback, Utc::now())
            .into_iter()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::FacilityNotFound(id.to_string()))
    }

    /// Register a facility in the record store.
    pub async fn create_facility(&self, new: NewFacility) -> Result<Facility> {
        validate_coordinates(new.location.lat, new.location.lng)?;
        if new.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if new.total_spots == 0 {
            return Err(Error::Validation("totalSpots must be > 0".into()));
        }
        let available = new.available_spots.unwrap_or(new.total_spots);
        if available > new.total_spots {
            return Err(Error::Validation(format!(
                "availableSpots {} exceeds totalSpots {}",
                available, new.total_spots
            )));
        }

        let facility = Facility {
            id: new
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("local_{}", Uuid::new_v4())),
            name: new.name.trim().to_string(),
            total_spots: new.total_spots,
            available_spots: available,
            location: new.location,
            last_update: Utc::now(),
            predicted_spots: None,
            confidence: None,
            sensors: Vec::new(),
        };
        let created = self.store.create_facility(facility).await?;
        info!("Registered facility {} ({})", created.id, created.name);
        Ok(created)
    }

    /// Set a stored facility's available count and notify subscribers.
    pub async fn update_availability(
        &self,
        id: &str,
        available: i64,
        sensors: Option<Vec<SensorReading>>,
    ) -> Result<Facility> {
        let current = self
            .store
            .find_facility(id)
            .await?
            .ok_or_else(|| Error::FacilityNotFound(id.to_string()))?;

        if available < 0 || available > i64::from(current.total_spots) {
            return Err(Error::Validation(format!(
                "availableSpots must be in 0..={} (got {})",
                current.total_spots, available
            )));
        }

        let now = Utc::now();
        let apply = move |f: &mut Facility| {
            f.set_available(available, now);
            if let Some(sensors) = &sensors {
                f.sensors = sensors.clone();
            }
        };
        let facility = self
            .store
            .modify_facility(id, &apply)
            .await?
            .ok_or_else(|| Error::FacilityNotFound(id.to_string()))?;

        self.cache.refresh_facility(&facility);
        self.broadcaster
            .publish(
                &ChangeEvent::from_facility(&facility),
                Scope::for_change(self.config.broadcast.fan_out, &facility.id),
            )
            .await;
        Ok(facility)
    }

    // ── Forecasts and history ─────────────────────────────────────────

    pub async fn predict(&self, id: &str, minutes_ahead: i64) -> Result<PredictionResult> {
        if !(0..=MAX_MINUTES_AHEAD).contains(&minutes_ahead) {
            return Err(Error::Validation(format!(
                "minutesAhead must be in 0..={MAX_MINUTES_AHEAD}"
            )));
        }
        let facility = self
            .store
            .find_facility(id)
            .await?
            .ok_or_else(|| Error::FacilityNotFound(id.to_string()))?;
        self.forecast(&facility, minutes_ahead, Utc::now()).await
    }

    /// Memoized forecast for the target hour window.
    async fn forecast(
        &self,
        facility: &Facility,
        minutes_ahead: i64,
        now: DateTime<Utc>,
    ) -> Result<PredictionResult> {
        let predicted_for = now + Duration::minutes(minutes_ahead);
        let window_start = hour_window(predicted_for);

        if let Some(memo) = self
            .store
            .find_unexpired_prediction(&facility.id, window_start, now)
            .await?
        {
            return Ok(PredictionResult {
                facility_id: facility.id.clone(),
                predicted_spots: memo.predicted_spots,
                confidence: memo.confidence,
                predicted_for,
            });
        }

        let prediction = self.engine.predict_for(facility, minutes_ahead, now).await?;
        let ttl = Duration::seconds(self.config.prediction.cache_ttl_secs as i64);
        self.store
            .create_prediction(PredictionCacheEntry {
                facility_id: facility.id.clone(),
                window_start,
                predicted_spots: prediction.predicted_available,
                confidence: prediction.confidence,
                created_at: now,
                expires_at: now + ttl,
            })
            .await?;

        Ok(PredictionResult {
            facility_id: facility.id.clone(),
            predicted_spots: prediction.predicted_available,
            confidence: prediction.confidence,
            predicted_for,
        })
    }

    /// Newest-first history for a stored facility.
    pub async fn history(&self, id: &str, limit: usize) -> Result<Vec<HistoricalRecord>> {
        if self.store.find_facility(id).await?.is_none() {
            return Err(Error::FacilityNotFound(id.to_string()));
        }
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.store.find_records(&HistoryQuery::recent(id, limit)).await
    }

    /// Capture the current state of a stored facility into history.
    pub async fn record_snapshot(&self, id: &str) -> Result<HistoricalRecord> {
        let facility = self
            .store
            .find_facility(id)
            .await?
            .ok_or_else(|| Error::FacilityNotFound(id.to_string()))?;
        let record = HistoricalRecord::capture(Uuid::new_v4().to_string(), &facility, Utc::now());
        self.store.create_record(record.clone()).await?;
        Ok(record)
    }

    pub async fn stats(&self) -> Result<FacilityStats> {
        let facilities = self.store.find_all_facilities().await?;
        Ok(FacilityStats::from_facilities(&facilities))
    }
}
