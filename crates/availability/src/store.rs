//! Record store contract and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Error, Facility, HistoricalRecord, PredictionCacheEntry, Result};
use tokio::sync::RwLock;

/// Filter for historical records. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub facility_id: String,
    pub day_of_week: Option<u8>,
    pub hour: Option<u8>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn recent(facility_id: &str, limit: usize) -> Self {
        Self {
            facility_id: facility_id.to_string(),
            day_of_week: None,
            hour: None,
            limit,
        }
    }

    pub fn at_slot(facility_id: &str, day_of_week: u8, hour: u8, limit: usize) -> Self {
        Self {
            facility_id: facility_id.to_string(),
            day_of_week: Some(day_of_week),
            hour: Some(hour),
            limit,
        }
    }

    fn matches(&self, record: &HistoricalRecord) -> bool {
        self.day_of_week.map_or(true, |d| record.day_of_week == d)
            && self.hour.map_or(true, |h| record.hour == h)
    }
}

/// Persistence the core relies on. Implementations must be safe to call
/// concurrently from request handlers and the broadcast job.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fails with `Validation` if the id is already taken.
    async fn create_facility(&self, facility: Facility) -> Result<Facility>;
    async fn find_facility(&self, id: &str) -> Result<Option<Facility>>;
    async fn find_all_facilities(&self) -> Result<Vec<Facility>>;
    /// Fails with `FacilityNotFound` if the id is unknown.
    async fn update_facility(&self, facility: &Facility) -> Result<()>;
    async fn delete_facility(&self, id: &str) -> Result<bool>;

    /// Apply `edit` to the current stored copy and persist the result.
    /// `None` if the id is unknown.
    ///
    /// The default reads then writes. Stores that can hold one lock across
    /// both steps should override it so concurrent writers never lose edits.
    async fn modify_facility(
        &self,
        id: &str,
        edit: &(dyn for<'f> Fn(&'f mut Facility) + Send + Sync),
    ) -> Result<Option<Facility>> {
        let Some(mut facility) = self.find_facility(id).await? else {
            return Ok(None);
        };
        edit(&mut facility);
        self.update_facility(&facility).await?;
        Ok(Some(facility))
    }

    async fn create_record(&self, record: HistoricalRecord) -> Result<()>;
    async fn find_records(&self, query: &HistoryQuery) -> Result<Vec<HistoricalRecord>>;

    /// Replaces any memo for the same facility and window.
    async fn create_prediction(&self, entry: PredictionCacheEntry) -> Result<()>;
    async fn find_unexpired_prediction(
        &self,
        facility_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<PredictionCacheEntry>>;
}

#[derive(Default)]
struct MemoryInner {
    facilities: BTreeMap<String, Facility>,
    records: HashMap<String, Vec<HistoricalRecord>>,
    predictions: HashMap<(String, DateTime<Utc>), PredictionCacheEntry>,
}

/// Process-local store backed by ordered maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self, facility_id: &str) -> usize {
        self.inner
            .read()
            .await
            .records
            .get(facility_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_facility(&self, facility: Facility) -> Result<Facility> {
        let mut inner = self.inner.write().await;
        if inner.facilities.contains_key(&facility.id) {
            return Err(Error::Validation(format!(
                "facility {} already exists",
                facility.id
            )));
        }
        inner
            .facilities
            .insert(facility.id.clone(), facility.clone());
        Ok(facility)
    }

    async fn find_facility(&self, id: &str) -> Result<Option<Facility>> {
        Ok(self.inner.read().await.facilities.get(id).cloned())
    }

    async fn find_all_facilities(&self) -> Result<Vec<Facility>> {
        Ok(self.inner.read().await.facilities.values().cloned().collect())
    }

    async fn update_facility(&self, facility: &Facility) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.facilities.get_mut(&facility.id) {
            Some(slot) => {
                *slot = facility.clone();
                Ok(())
            }
            None => Err(Error::FacilityNotFound(facility.id.clone())),
        }
    }

    async fn delete_facility(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.facilities.remove(id).is_some())
    }

    async fn modify_facility(
        &self,
        id: &str,
        edit: &(dyn for<'f> Fn(&'f mut Facility) + Send + Sync),
    ) -> Result<Option<Facility>> {
        let mut inner = self.inner.write().await;
        Ok(inner.facilities.get_mut(id).map(|slot| {
            edit(slot);
            slot.clone()
        }))
    }

    async fn create_record(&self, record: HistoricalRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .records
            .entry(record.facility_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn find_records(&self, query: &HistoryQuery) -> Result<Vec<HistoricalRecord>> {
        let inner = self.inner.read().await;
        let Some(records) = inner.records.get(&query.facility_id) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<HistoricalRecord> = records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(query.limit);
        Ok(matched)
    }

    async fn create_prediction(&self, entry: PredictionCacheEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = entry.created_at;
        inner.predictions.retain(|_, e| !e.is_expired(now));
        inner
            .predictions
            .insert((entry.facility_id.clone(), entry.window_start), entry);
        Ok(())
    }

    async fn find_unexpired_prediction(
        &self,
        facility_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<PredictionCacheEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .predictions
            .get(&(facility_id.to_string(), window_start))
            .filter(|e| !e.is_expired(now))
            .cloned())
    }
}
