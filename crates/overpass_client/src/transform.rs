//! Maps raw Overpass elements into `Facility` records.
//!
//! Upstream data rarely carries live occupancy and often lacks capacity,
//! so missing figures are synthesized from an RNG seeded by the element id.
//! The same element therefore always yields the same facility, which keeps
//! cached and freshly fetched results identical.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::{Facility, GeoPoint, OSM_ID_PREFIX};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::OverpassElement;

/// Hard cap on facilities produced from one response.
pub const MAX_FACILITIES: usize = 50;

const MIN_SYNTH_CAPACITY: u32 = 20;
const MAX_SYNTH_CAPACITY: u32 = 200;

/// Convert elements to facilities, keeping at most [`MAX_FACILITIES`].
///
/// Facility ids carry only the numeric element id, so a node and a way
/// sharing an id map to one facility; the first element wins.
/// `fallback` is used for elements with neither coordinates nor a center.
pub fn transform(
    elements: &[OverpassElement],
    fallback: GeoPoint,
    now: DateTime<Utc>,
) -> Vec<Facility> {
    let mut seen = HashSet::new();
    elements
        .iter()
        .filter(|el| seen.insert(el.id))
        .take(MAX_FACILITIES)
        .map(|el| to_facility(el, fallback, now))
        .collect()
}

fn to_facility(el: &OverpassElement, fallback: GeoPoint, now: DateTime<Utc>) -> Facility {
    let mut rng = StdRng::seed_from_u64(el.id);

    let synthesized = rng.gen_range(MIN_SYNTH_CAPACITY..=MAX_SYNTH_CAPACITY);
    let total_spots = capacity_hint(el).unwrap_or(synthesized);
    let occupied = rng.gen_range(0..=total_spots);
    let available_spots = total_spots.saturating_sub(occupied);

    Facility {
        id: format!("{}{}", OSM_ID_PREFIX, el.id),
        name: display_name(el),
        total_spots,
        available_spots,
        location: location(el, fallback),
        last_update: now,
        predicted_spots: None,
        confidence: None,
        sensors: Vec::new(),
    }
}

fn capacity_hint(el: &OverpassElement) -> Option<u32> {
    el.tags
        .get("capacity")
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|&c| c > 0)
}

fn display_name(el: &OverpassElement) -> String {
    el.tags
        .get("name")
        .or_else(|| el.tags.get("operator"))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Parking {}", el.id))
}

fn location(el: &OverpassElement, fallback: GeoPoint) -> GeoPoint {
    match (el.lat, el.lon, el.center) {
        (Some(lat), Some(lon), _) => GeoPoint::new(lat, lon),
        (_, _, Some(center)) => GeoPoint::new(center.lat, center.lon),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverpassResponse;

    fn sample_response() -> &'static str {
        r#"{
            "elements": [
                {"type": "node", "id": 101, "lat": 48.85, "lon": 2.35,
                 "tags": {"amenity": "parking", "name": "Rivoli", "capacity": "120"}},
                {"type": "way", "id": 202, "center": {"lat": 48.86, "lon": 2.36},
                 "tags": {"amenity": "parking", "operator": "Indigo", "capacity": "lots"}},
                {"type": "relation", "id": 303}
            ]
        }"#
    }

    fn parsed() -> OverpassResponse {
        serde_json::from_str(sample_response()).expect("response should deserialize")
    }

    #[test]
    fn test_capacity_hint_and_location_fallbacks() {
        let fallback = GeoPoint::new(1.0, 2.0);
        let facilities = transform(&parsed().elements, fallback, Utc::now());
        assert_eq!(facilities.len(), 3);

        let rivoli = &facilities[0];
        assert_eq!(rivoli.id, "osm_101");
        assert_eq!(rivoli.name, "Rivoli");
        assert_eq!(rivoli.total_spots, 120);
        assert_eq!(rivoli.location, GeoPoint::new(48.85, 2.35));

        let indigo = &facilities[1];
        assert_eq!(indigo.name, "Indigo");
        assert!((MIN_SYNTH_CAPACITY..=MAX_SYNTH_CAPACITY).contains(&indigo.total_spots));
        assert_eq!(indigo.location, GeoPoint::new(48.86, 2.36));

        let bare = &facilities[2];
        assert_eq!(bare.name, "Parking 303");
        assert_eq!(bare.location, fallback);

        for f in &facilities {
            assert!(f.available_spots <= f.total_spots);
        }
    }

    #[test]
    fn test_transform_is_deterministic() {
        let now = Utc::now();
        let fallback = GeoPoint::new(0.0, 0.0);
        let a = transform(&parsed().elements, fallback, now);
        let b = transform(&parsed().elements, fallback, now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_caps_at_fifty() {
        let elements: Vec<OverpassElement> = (0..80)
            .map(|id| OverpassElement {
                kind: "node".into(),
                id,
                lat: Some(0.0),
                lon: Some(0.0),
                center: None,
                tags: Default::default(),
            })
            .collect();
        let facilities = transform(&elements, GeoPoint::new(0.0, 0.0), Utc::now());
        assert_eq!(facilities.len(), MAX_FACILITIES);
        assert_eq!(facilities[49].id, "osm_49");
    }

    #[test]
    fn test_shared_element_id_yields_one_facility() {
        let raw = r#"{"elements": [
            {"type": "node", "id": 7, "lat": 1.0, "lon": 2.0, "tags": {"name": "Node lot"}},
            {"type": "way", "id": 7, "center": {"lat": 3.0, "lon": 4.0}, "tags": {"name": "Way lot"}},
            {"type": "way", "id": 8, "center": {"lat": 5.0, "lon": 6.0}}
        ]}"#;
        let response: OverpassResponse = serde_json::from_str(raw).unwrap();
        let facilities = transform(&response.elements, GeoPoint::new(0.0, 0.0), Utc::now());

        let ids: Vec<_> = facilities.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["osm_7", "osm_8"]);
        assert_eq!(facilities[0].name, "Node lot");
    }
}
