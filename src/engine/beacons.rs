//! BLE scan intake and the last-seen beacon cache.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distance::DistanceRange;
use crate::entity::{Entity, EntityId, EntityType};
use crate::message::{Channel, MessageBody};

use super::Inner;

/// Most beacons kept from one scan.
pub(super) const LAST_SEEN_CAPACITY: usize = 3;

/// One ranged beacon from a BLE scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconReading {
    /// `uuid:major:minor`.
    pub beacon_id: EntityId,
    /// Estimated distance in meters.
    pub meters: f64,
}

impl BeaconReading {
    /// Reading for `beacon_id` at `meters`.
    #[must_use]
    pub fn new(beacon_id: impl Into<EntityId>, meters: f64) -> Self {
        Self {
            beacon_id: beacon_id.into(),
            meters,
        }
    }

    /// Reading for an iBeacon-style identifier triple.
    #[must_use]
    pub fn ibeacon(uuid: &str, major: u16, minor: u16, meters: f64) -> Self {
        Self::new(format!("{uuid}:{major}:{minor}"), meters)
    }

    /// Coarse range for the measured distance.
    #[must_use]
    pub fn distance(&self) -> DistanceRange {
        DistanceRange::from_meters(self.meters)
    }

    /// The beacon as an entity carrying its ranged distance.
    #[must_use]
    pub fn to_entity(&self) -> Entity {
        Entity::new(self.beacon_id.clone(), EntityType::BleBeacon).with_distance(self.distance())
    }
}

/// Beacons from the latest non-empty scan: all of them when fewer than
/// four, else the two nearest and the farthest.
fn select_cached(readings: &[BeaconReading]) -> Vec<Entity> {
    if readings.len() <= LAST_SEEN_CAPACITY {
        return readings.iter().map(BeaconReading::to_entity).collect();
    }
    let mut sorted: Vec<&BeaconReading> = readings.iter().collect();
    sorted.sort_by(|a, b| a.meters.total_cmp(&b.meters));
    let farthest = sorted[sorted.len() - 1];
    [sorted[0], sorted[1], farthest]
        .into_iter()
        .map(BeaconReading::to_entity)
        .collect()
}

/// Short-lock cache of recently seen beacons. Reads hand out copies.
#[derive(Debug, Default)]
pub(super) struct LastSeenBeacons {
    beacons: Mutex<Vec<Entity>>,
}

impl LastSeenBeacons {
    fn lock(&self) -> MutexGuard<'_, Vec<Entity>> {
        self.beacons.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn snapshot(&self) -> Vec<Entity> {
        self.lock().clone()
    }

    fn replace(&self, readings: &[BeaconReading]) {
        let selected = select_cached(readings);
        *self.lock() = selected;
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

impl Inner {
    /// Counts one scan; returns true, and restarts the count, when the scan
    /// completes an interval.
    fn count_scan(&self, interval: u32) -> bool {
        let previous = self
            .scan_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(if n + 1 >= interval { 0 } else { n + 1 })
            })
            .unwrap_or_else(|n| n);
        previous + 1 >= interval
    }

    pub(super) fn on_beacon_scan(self: &Arc<Self>, readings: &[BeaconReading]) {
        if readings.is_empty() {
            self.beacons.clear();
            return;
        }
        if self.is_stopped() {
            return;
        }

        let me = self.self_entity();
        let beacons: Vec<Entity> = readings.iter().map(BeaconReading::to_entity).collect();
        debug!(count = beacons.len(), "beacon scan");

        for beacon in &beacons {
            self.evaluate_proximity(me.clone(), beacon.clone(), beacon.distance, String::new());
        }
        self.evaluate_geofence(me.clone(), beacons.clone(), String::new());

        if self.advertise().proximity_changes_enabled {
            let interval = self.config.beacon_report_interval.max(1);
            if self.count_scan(interval) {
                let log_id = self.new_log_id();
                self.publish(
                    &Channel::Proximity,
                    MessageBody::ProxBeacons { entity: me, beacons },
                    log_id,
                );
            }
        }

        self.beacons.replace(readings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_scans_are_cached_verbatim() {
        let readings = [BeaconReading::new("a:1:1", 5.0), BeaconReading::new("a:1:2", 0.1)];
        let cached = select_cached(&readings);
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].distance, DistanceRange::Far);
        assert_eq!(cached[1].distance, DistanceRange::Immediate);
        assert!(cached.iter().all(Entity::is_beacon));
    }

    #[test]
    fn test_large_scans_keep_two_nearest_and_farthest() {
        let readings = [
            BeaconReading::new("a:1:1", 3.0),
            BeaconReading::new("a:1:2", 0.5),
            BeaconReading::new("a:1:3", 9.0),
            BeaconReading::new("a:1:4", 1.0),
            BeaconReading::new("a:1:5", 4.0),
        ];
        let ids: Vec<String> = select_cached(&readings)
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, ["a:1:2", "a:1:4", "a:1:3"]);
    }

    #[test]
    fn test_concurrent_scans_report_once_per_interval() {
        use crate::engine::{EngineConfig, ProximityEngine};
        use crate::transport::InMemoryTransport;

        let transport = Arc::new(InMemoryTransport::new());
        let engine = ProximityEngine::new(
            Entity::new("me", EntityType::Device),
            transport.clone(),
            EngineConfig::default(),
        )
        .unwrap();

        std::thread::scope(|s| {
            for _ in 0..6 {
                s.spawn(|| {
                    for _ in 0..10 {
                        engine.on_beacon_scan(&[BeaconReading::new("u:1:1", 2.0)]);
                    }
                });
            }
        });
        assert_eq!(transport.published_on(&Channel::Proximity).len(), 10);
    }

    #[test]
    fn test_cache_replace_and_clear() {
        let cache = LastSeenBeacons::default();
        cache.replace(&[BeaconReading::ibeacon("u", 1, 2, 0.2)]);
        assert_eq!(cache.snapshot()[0].id.as_str(), "u:1:2");
        cache.clear();
        assert!(cache.snapshot().is_empty());
    }
}
