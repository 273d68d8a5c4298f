//! Two-tier in-memory cache in front of the Overpass mirrors.
//!
//! The area tier holds the single most recent nearby-listing snapshot;
//! the entity tier holds individual facilities keyed by id. Both expire
//! lazily on read. Locks are held only for in-memory swaps, never across
//! an `.await`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use common::config::CacheConfig;
use common::Facility;
use dashmap::DashMap;
use tracing::debug;

/// Area key: coordinates rounded to a fixed number of decimals, plus radius.
///
/// Rounded coordinates are stored as scaled integers so equality is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaKey {
    lat_e: i64,
    lng_e: i64,
    precision: u32,
    pub radius_m: u32,
}

impl AreaKey {
    pub fn new(lat: f64, lng: f64, radius_m: u32, precision: u32) -> Self {
        let scale = 10f64.powi(precision as i32);
        Self {
            lat_e: (lat * scale).round() as i64,
            lng_e: (lng * scale).round() as i64,
            precision,
            radius_m,
        }
    }
}

#[derive(Debug)]
struct AreaEntry {
    key: AreaKey,
    facilities: Vec<Facility>,
    /// id → position in `facilities`.
    index: HashMap<String, usize>,
    captured_at: Instant,
}

#[derive(Debug, Clone)]
struct EntityEntry {
    facility: Facility,
    captured_at: Instant,
}

/// Area snapshot plus per-facility snapshots with independent TTLs.
#[derive(Debug)]
pub struct TieredCache {
    area: RwLock<Option<AreaEntry>>,
    entities: DashMap<String, EntityEntry>,
    area_ttl: Duration,
    entity_ttl: Duration,
}

impl TieredCache {
    pub fn new(area_ttl: Duration, entity_ttl: Duration) -> Self {
        Self {
            area: RwLock::new(None),
            entities: DashMap::new(),
            area_ttl,
            entity_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            Duration::from_secs(config.area_ttl_secs),
            Duration::from_secs(config.entity_ttl_secs),
        )
    }

    // ── Area tier ─────────────────────────────────────────────────────

    pub fn get_area(&self, key: &AreaKey) -> Option<Vec<Facility>> {
        self.get_area_at(key, Instant::now())
    }

    /// Snapshot for `key`, or `None` if absent, for another key, or older
    /// than the area TTL at `now`.
    pub fn get_area_at(&self, key: &AreaKey, now: Instant) -> Option<Vec<Facility>> {
        let guard = self.area.read().unwrap_or_else(PoisonError::into_inner);
        let entry = guard.as_ref()?;
        if entry.key != *key {
            debug!("Area cache miss: key mismatch");
            return None;
        }
        if now.saturating_duration_since(entry.captured_at) > self.area_ttl {
            debug!("Area cache miss: snapshot expired");
            return None;
        }
        Some(entry.facilities.clone())
    }

    pub fn put_area(&self, key: AreaKey, facilities: Vec<Facility>) {
        self.put_area_at(key, facilities, Instant::now());
    }

    /// Replace the resident snapshot and rebuild its index.
    pub fn put_area_at(&self, key: AreaKey, facilities: Vec<Facility>, now: Instant) {
        let index = facilities
            .iter()
            .enumerate()
            .map(|(pos, f)| (f.id.clone(), pos))
            .collect();
        let entry = AreaEntry {
            key,
            facilities,
            index,
            captured_at: now,
        };
        *self.area.write().unwrap_or_else(PoisonError::into_inner) = Some(entry);
    }

    /// Look an id up in the resident snapshot, if it is still fresh.
    pub fn lookup_indexed(&self, id: &str) -> Option<Facility> {
        self.lookup_indexed_at(id, Instant::now())
    }

    pub fn lookup_indexed_at(&self, id: &str, now: Instant) -> Option<Facility> {
        let guard = self.area.read().unwrap_or_else(PoisonError::into_inner);
        let entry = guard.as_ref()?;
        if now.saturating_duration_since(entry.captured_at) > self.area_ttl {
            return None;
        }
        entry
            .index
            .get(id)
            .and_then(|&pos| entry.facilities.get(pos))
            .cloned()
    }

    // ── Entity tier ───────────────────────────────────────────────────

    pub fn get_facility(&self, id: &str) -> Option<Facility> {
        self.get_facility_at(id, Instant::now())
    }

    /// Facility snapshot for `id`; an expired entry is evicted and missed.
    pub fn get_facility_at(&self, id: &str, now: Instant) -> Option<Facility> {
        {
            let entry = self.entities.get(id)?;
            if !self.entity_expired(&entry, now) {
                return Some(entry.facility.clone());
            }
        }
        // A concurrent rewrite between the read and here keeps its entry.
        if self
            .entities
            .remove_if(id, |_, entry| self.entity_expired(entry, now))
            .is_some()
        {
            debug!("Entity cache evict: {}", id);
        }
        None
    }

    fn entity_expired(&self, entry: &EntityEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.captured_at) > self.entity_ttl
    }

    pub fn put_facility(&self, facility: Facility) {
        self.put_facility_at(facility, Instant::now());
    }

    pub fn put_facility_at(&self, facility: Facility, now: Instant) {
        self.entities.insert(
            facility.id.clone(),
            EntityEntry {
                facility,
                captured_at: now,
            },
        );
    }

    /// Overwrite resident copies of a mutated facility in both tiers,
    /// keeping their capture times.
    pub fn refresh_facility(&self, facility: &Facility) {
        if let Some(mut entry) = self.entities.get_mut(&facility.id) {
            entry.facility = facility.clone();
        }

        let mut guard = self.area.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = guard.as_mut() {
            if let Some(&pos) = entry.index.get(&facility.id) {
                entry.facilities[pos] = facility.clone();
            }
        }
    }

    pub fn entity_len(&self) -> usize {
        self.entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::GeoPoint;

    fn facility(id: &str, available: u32) -> Facility {
        Facility {
            id: id.into(),
            name: format!("Lot {id}"),
            total_spots: 50,
            available_spots: available,
            location: GeoPoint::new(0.0, 0.0),
            last_update: Utc::now(),
            predicted_spots: None,
            confidence: None,
            sensors: Vec::new(),
        }
    }

    fn cache() -> TieredCache {
        TieredCache::from_config(&CacheConfig::default())
    }

    #[test]
    fn test_area_key_rounds_coordinates() {
        let a = AreaKey::new(48.85661, 2.35222, 1000, 3);
        let b = AreaKey::new(48.8564, 2.3518, 1000, 3);
        assert_eq!(a, b);
        assert_ne!(a, AreaKey::new(48.85661, 2.35222, 500, 3));
        assert_eq!(a, AreaKey::new(48.857, 2.352, 1000, 3));
    }

    #[test]
    fn test_area_hit_until_ttl() {
        let cache = cache();
        let key = AreaKey::new(1.0, 2.0, 1000, 3);
        let t0 = Instant::now();
        cache.put_area_at(key, vec![facility("a", 1)], t0);

        assert!(cache.get_area_at(&key, t0 + Duration::from_secs(599)).is_some());
        assert!(cache.get_area_at(&key, t0 + Duration::from_secs(600)).is_some());
        assert!(cache.get_area_at(&key, t0 + Duration::from_secs(601)).is_none());
    }

    #[test]
    fn test_area_key_mismatch_and_replacement() {
        let cache = cache();
        let k1 = AreaKey::new(1.0, 2.0, 1000, 3);
        let k2 = AreaKey::new(3.0, 4.0, 1000, 3);
        cache.put_area(k1, vec![facility("a", 1)]);
        assert!(cache.get_area(&k2).is_none());

        cache.put_area(k2, vec![facility("b", 2)]);
        assert!(cache.get_area(&k1).is_none());
        assert_eq!(cache.lookup_indexed("b").map(|f| f.available_spots), Some(2));
        assert!(cache.lookup_indexed("a").is_none());
    }

    #[test]
    fn test_entity_evicted_after_ttl_and_rewrite_resets_timer() {
        let cache = cache();
        let t0 = Instant::now();
        cache.put_facility_at(facility("a", 1), t0);

        let t1 = t0 + Duration::from_secs(3000);
        assert!(cache.get_facility_at("a", t1).is_some());
        cache.put_facility_at(facility("a", 2), t1);

        let t2 = t0 + Duration::from_secs(3601);
        assert_eq!(cache.get_facility_at("a", t2).map(|f| f.available_spots), Some(2));

        let t3 = t1 + Duration::from_secs(3601);
        assert!(cache.get_facility_at("a", t3).is_none());
        assert_eq!(cache.entity_len(), 0);
    }

    #[test]
    fn test_refresh_updates_both_tiers() {
        let cache = cache();
        let key = AreaKey::new(1.0, 2.0, 1000, 3);
        cache.put_area(key, vec![facility("a", 1), facility("b", 5)]);
        cache.put_facility(facility("a", 1));

        cache.refresh_facility(&facility("a", 30));

        assert_eq!(cache.get_facility("a").map(|f| f.available_spots), Some(30));
        let area = cache.get_area(&key).unwrap();
        assert_eq!(area[0].available_spots, 30);
        assert_eq!(area[1].available_spots, 5);
    }
}
