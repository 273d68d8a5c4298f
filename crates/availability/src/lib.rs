//! Facility availability core.
//!
//! Caching in front of the Overpass mirrors, forecasts, the periodic
//! broadcast job and the subscriber registry it publishes through.

pub mod broadcast;
pub mod cache;
pub mod prediction;
pub mod service;
pub mod store;
pub mod subscriptions;

pub use broadcast::{BroadcastScheduler, CycleReport};
pub use cache::{AreaKey, TieredCache};
pub use prediction::PredictionEngine;
pub use service::FacilityService;
pub use store::{HistoryQuery, MemoryStore, RecordStore};
pub use subscriptions::{Broadcaster, Scope, SubscribeOutcome, SubscriptionRegistry, WILDCARD_TOPIC};

use rand::rngs::StdRng;
use rand::SeedableRng;

/// RNG for one component. With a seed, each `stream` gets its own
/// reproducible sequence; without one, entropy is used.
pub fn seeded_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}
