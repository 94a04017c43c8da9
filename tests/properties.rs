//! Property-based tests for the evaluation primitives.
//!
//! - DistanceRange order is total, fixed and agrees with the meter mapping
//! - Group evaluation is a pure predicate
//! - Geofence detected sets never exceed their capacity
//! - Deferred task cancellation is safe in any order

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use proxmesh::subscription::MAX_DETECTED_ENTITIES;
use proxmesh::{
    fuse_distance, DeferredTasks, DetectedEntities, DistanceRange, Entity, EntityId, EntityType,
    Group, PropertiesFilter,
};

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn distance_strategy() -> impl Strategy<Value = DistanceRange> {
    prop::sample::select(DistanceRange::ALL.to_vec())
}

fn entity_strategy() -> impl Strategy<Value = Entity> {
    (
        "[a-z]{1,4}(:[0-9]{1,2}){0,2}",
        prop::bool::ANY,
        0i64..10,
        prop::option::of("[a-c]"),
    )
        .prop_map(|(id, beacon, level, role)| {
            let entity_type = if beacon {
                EntityType::BleBeacon
            } else {
                EntityType::Device
            };
            let mut props = json!({"level": level});
            if let Some(role) = role {
                props["role"] = json!(role);
            }
            Entity::new(id, entity_type)
                .with_properties(json!({ "properties": props }))
                .unwrap()
        })
}

fn filter_strategy() -> impl Strategy<Value = PropertiesFilter> {
    let leaf = prop_oneof![
        (0i64..10).prop_map(|v| PropertiesFilter::lt("level", json!(v))),
        (0i64..10).prop_map(|v| PropertiesFilter::gt("level", json!(v))),
        "[a-c]".prop_map(|v| PropertiesFilter::equals("role", json!(v))),
        Just(PropertiesFilter::exists("role")),
        Just(PropertiesFilter::not_exists("role")),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| PropertiesFilter::and(l, r)),
            (inner.clone(), inner).prop_map(|(l, r)| PropertiesFilter::or(l, r)),
        ]
    })
}

fn group_strategy() -> impl Strategy<Value = Group> {
    (
        prop::option::of("[a-z]{1,4}(:[0-9]{1,2}){0,2}"),
        prop::option::of(prop::bool::ANY),
        prop::option::of(filter_strategy()),
    )
        .prop_map(|(id, beacon, filter)| {
            let mut group = Group::new("g");
            if let Some(id) = id {
                group = group.with_entity_id(id);
            }
            if let Some(beacon) = beacon {
                group = group.with_entity_type(if beacon {
                    EntityType::BleBeacon
                } else {
                    EntityType::Device
                });
            }
            if let Some(filter) = filter {
                group = group.with_filter(filter);
            }
            group
        })
}

// =============================================================================
// DISTANCE RANGE
// =============================================================================

mod distance_properties {
    use super::*;

    proptest! {
        #[test]
        fn order_agrees_with_ordinal(a in distance_strategy(), b in distance_strategy()) {
            prop_assert_eq!(a.cmp(&b), a.ordinal().cmp(&b.ordinal()));
        }

        #[test]
        fn meter_mapping_is_monotonic(x in 0.0f64..50.0, y in 0.0f64..50.0) {
            let (near, far) = if x <= y { (x, y) } else { (y, x) };
            prop_assert!(DistanceRange::from_meters(near) <= DistanceRange::from_meters(far));
            prop_assert!(DistanceRange::from_meters(far) <= DistanceRange::Far);
        }

        #[test]
        fn fusion_without_common_beacon_is_same_wifi(
            peer in prop::collection::vec(distance_strategy(), 0..4),
            mine in prop::collection::vec(distance_strategy(), 0..4),
        ) {
            let peer: Vec<Entity> = peer
                .into_iter()
                .enumerate()
                .map(|(i, d)| Entity::new(format!("p:{i}"), EntityType::BleBeacon).with_distance(d))
                .collect();
            let mine: Vec<Entity> = mine
                .into_iter()
                .enumerate()
                .map(|(i, d)| Entity::new(format!("m:{i}"), EntityType::BleBeacon).with_distance(d))
                .collect();
            prop_assert_eq!(fuse_distance(&peer, &mine), DistanceRange::SameWifi);
        }

        #[test]
        fn fusion_with_common_beacon_never_exceeds_same_beacon(
            theirs in distance_strategy(),
            ours in distance_strategy(),
        ) {
            let peer = [Entity::new("b", EntityType::BleBeacon).with_distance(theirs)];
            let mine = [Entity::new("b", EntityType::BleBeacon).with_distance(ours)];
            let fused = fuse_distance(&peer, &mine);
            prop_assert!(fused <= DistanceRange::SameBeacon);
            if theirs == DistanceRange::Immediate && ours == DistanceRange::Immediate {
                prop_assert_eq!(fused, DistanceRange::Immediate);
            }
        }
    }
}

// =============================================================================
// GROUP EVALUATION
// =============================================================================

mod group_properties {
    use super::*;

    proptest! {
        #[test]
        fn evaluation_is_pure(group in group_strategy(), entity in entity_strategy()) {
            let first = group.evaluate(&entity);
            prop_assert_eq!(first, group.evaluate(&entity));
            prop_assert_eq!(first, group.clone().evaluate(&entity.clone()));
        }

        #[test]
        fn default_group_matches_everything(entity in entity_strategy()) {
            prop_assert!(Group::default().evaluate(&entity));
        }

        #[test]
        fn beacon_prefix_matches_full_id(
            uuid in "[a-f0-9]{4}",
            major in 0u16..100,
            minor in 0u16..100,
        ) {
            let beacon = Entity::beacon(&uuid, major, minor, DistanceRange::Near);
            let by_uuid = Group::new("u").with_entity_id(uuid.as_str());
            let by_major = Group::new("m").with_entity_id(format!("{uuid}:{major}"));
            let exact = Group::new("e").with_entity_id(format!("{uuid}:{major}:{minor}"));
            let other_major = Group::new("o").with_entity_id(format!("{uuid}:{}", major + 1));
            prop_assert!(by_uuid.evaluate(&beacon));
            prop_assert!(by_major.evaluate(&beacon));
            prop_assert!(exact.evaluate(&beacon));
            prop_assert!(!other_major.evaluate(&beacon));
        }
    }
}

// =============================================================================
// DETECTED SET
// =============================================================================

mod detected_properties {
    use super::*;

    proptest! {
        #[test]
        fn capacity_is_never_exceeded(ops in prop::collection::vec((prop::bool::ANY, 0u8..80), 0..300)) {
            let mut detected = DetectedEntities::new();
            let mut model: HashSet<u8> = HashSet::new();
            for (insert, n) in ops {
                let id = EntityId::new(format!("e{n}"));
                if insert {
                    let accepted = detected.insert(id);
                    if model.contains(&n) || model.len() < MAX_DETECTED_ENTITIES {
                        prop_assert!(accepted);
                        model.insert(n);
                    } else {
                        prop_assert!(!accepted);
                    }
                } else {
                    prop_assert_eq!(detected.remove(&id), model.remove(&n));
                }
                prop_assert!(detected.len() <= MAX_DETECTED_ENTITIES);
                prop_assert_eq!(detected.len(), model.len());
            }
        }
    }
}

// =============================================================================
// DEFERRED TASKS
// =============================================================================

mod timer_properties {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Any interleaving of cancels runs each armed task at most once and
        /// never runs a task cancelled before its deadline.
        #[test]
        fn cancel_is_idempotent(cancels in prop::collection::vec(0u8..4, 0..12)) {
            let timers = DeferredTasks::new("prop").unwrap();
            let fired = Arc::new(AtomicUsize::new(0));
            for key in 0u8..4 {
                let fired = Arc::clone(&fired);
                timers
                    .schedule(key, Duration::from_millis(500), move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }

            let mut cancelled = HashSet::new();
            for key in cancels {
                let was_pending = timers.cancel(&key);
                prop_assert_eq!(was_pending, cancelled.insert(key));
            }
            prop_assert_eq!(timers.pending(), 4 - cancelled.len());

            timers.stop();
            prop_assert_eq!(fired.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn cancel_after_fire_is_noop(delay_ms in 0u64..5) {
            let timers = DeferredTasks::new("prop").unwrap();
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&fired);
            timers
                .schedule("k", Duration::from_millis(delay_ms), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            prop_assert_eq!(fired.load(Ordering::SeqCst), 1);
            prop_assert!(!timers.cancel(&"k"));
            prop_assert!(!timers.cancel(&"k"));
        }
    }
}
