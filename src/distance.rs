//! Coarse distance buckets and beacon-based distance fusion.
//!
//! `DistanceRange` is totally ordered by increasing uncertainty: every
//! threshold comparison in the crate goes through this ordering, so the
//! variant order below must never change.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// An ordered, coarse-grained distance/uncertainty bucket.
///
/// `a <= b` means "`a` is at least as close as `b`".
///
/// # Examples
///
/// ```
/// use proxmesh::DistanceRange;
///
/// assert!(DistanceRange::Immediate < DistanceRange::Near);
/// assert!(DistanceRange::Remote < DistanceRange::SameBeacon);
/// assert!(DistanceRange::SameWifi < DistanceRange::Unknown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistanceRange {
    /// 0 m to 0.5 m.
    Immediate,
    /// 0.5 m to 2 m.
    NextTo,
    /// 2 m to 4 m.
    Near,
    /// 4 m to 8 m.
    Far,
    /// More than 8 m.
    Remote,
    /// Both sides see the same BLE beacon, no metric estimate.
    SameBeacon,
    /// Both sides are on the same network, no beacon evidence.
    SameWifi,
    /// Nothing known.
    #[default]
    Unknown,
}

impl DistanceRange {
    /// All variants in ascending order.
    pub const ALL: [Self; 8] = [
        Self::Immediate,
        Self::NextTo,
        Self::Near,
        Self::Far,
        Self::Remote,
        Self::SameBeacon,
        Self::SameWifi,
        Self::Unknown,
    ];

    /// Position in the total order.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// True if `self` is at least as close as `threshold`.
    #[must_use]
    pub fn within(self, threshold: Self) -> bool {
        self <= threshold
    }

    /// Maps a ranged BLE distance in meters to its bucket.
    ///
    /// Total over all inputs; negative or NaN readings land in `Immediate`
    /// and `Far` respectively.
    #[must_use]
    pub fn from_meters(meters: f64) -> Self {
        if meters < 0.6 {
            Self::Immediate
        } else if meters < 2.1 {
            Self::NextTo
        } else if meters < 4.1 {
            Self::Near
        } else {
            Self::Far
        }
    }

    /// Wire name of the variant.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::NextTo => "NEXT_TO",
            Self::Near => "NEAR",
            Self::Far => "FAR",
            Self::Remote => "REMOTE",
            Self::SameBeacon => "SAME_BEACON",
            Self::SameWifi => "SAME_WIFI",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DistanceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fuses a peer's beacon observations with ours into one device-to-device estimate.
///
/// Only beacons present in both lists (by id) contribute. With no beacon in
/// common the result is `SameWifi`; otherwise fusion starts at `SameBeacon`
/// and improves it per common pair:
///
/// - peer sees the beacon `Immediate`/`NextTo`: if our reading beats the current
///   best, take the closer of the two readings;
/// - otherwise: if we are within `NextTo` of the beacon and the peer's reading
///   beats the current best, take the peer's reading.
///
/// Pairs are visited peer-major in list order and the first improving
/// assignment wins ties. This order is incidental, not a guarantee.
#[must_use]
pub fn fuse_distance(peer_beacons: &[Entity], my_beacons: &[Entity]) -> DistanceRange {
    let mut best = DistanceRange::SameBeacon;
    let mut any_common = false;

    for common in peer_beacons {
        for mine in my_beacons.iter().filter(|m| m.id == common.id) {
            any_common = true;
            let theirs = common.distance;
            let ours = mine.distance;
            match theirs {
                DistanceRange::Immediate | DistanceRange::NextTo => {
                    if ours < best {
                        best = ours.min(theirs);
                    }
                }
                _ => {
                    if ours <= DistanceRange::NextTo && theirs < best {
                        best = theirs;
                    }
                }
            }
        }
    }

    if any_common {
        best
    } else {
        DistanceRange::SameWifi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;

    fn beacon(id: &str, d: DistanceRange) -> Entity {
        Entity::new(id, EntityType::BleBeacon).with_distance(d)
    }

    #[test]
    fn test_ordinals_follow_declaration_order() {
        for (idx, d) in DistanceRange::ALL.iter().enumerate() {
            assert_eq!(usize::from(d.ordinal()), idx);
        }
        assert_eq!(DistanceRange::SameBeacon.ordinal(), 5);
        assert_eq!(DistanceRange::SameWifi.ordinal(), 6);
        assert_eq!(DistanceRange::Unknown.ordinal(), 7);
    }

    #[test]
    fn test_default_is_unknown() {
        assert_eq!(DistanceRange::default(), DistanceRange::Unknown);
    }

    #[test]
    fn test_from_meters_boundaries() {
        assert_eq!(DistanceRange::from_meters(0.0), DistanceRange::Immediate);
        assert_eq!(DistanceRange::from_meters(0.59), DistanceRange::Immediate);
        assert_eq!(DistanceRange::from_meters(0.6), DistanceRange::NextTo);
        assert_eq!(DistanceRange::from_meters(2.09), DistanceRange::NextTo);
        assert_eq!(DistanceRange::from_meters(2.1), DistanceRange::Near);
        assert_eq!(DistanceRange::from_meters(4.0), DistanceRange::Near);
        assert_eq!(DistanceRange::from_meters(4.1), DistanceRange::Far);
        assert_eq!(DistanceRange::from_meters(250.0), DistanceRange::Far);
        assert_eq!(DistanceRange::from_meters(f64::NAN), DistanceRange::Far);
    }

    #[test]
    fn test_within_uses_ordering() {
        assert!(DistanceRange::Immediate.within(DistanceRange::Near));
        assert!(DistanceRange::Near.within(DistanceRange::Near));
        assert!(!DistanceRange::Far.within(DistanceRange::Near));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&DistanceRange::SameWifi).unwrap();
        assert_eq!(json, "\"SAME_WIFI\"");
        let back: DistanceRange = serde_json::from_str("\"NEXT_TO\"").unwrap();
        assert_eq!(back, DistanceRange::NextTo);
    }

    #[test]
    fn test_fuse_no_common_beacon_is_same_wifi() {
        let peer = [beacon("u:1:1", DistanceRange::Immediate)];
        let mine = [beacon("u:1:2", DistanceRange::Immediate)];
        assert_eq!(fuse_distance(&peer, &mine), DistanceRange::SameWifi);
        assert_eq!(fuse_distance(&[], &mine), DistanceRange::SameWifi);
    }

    #[test]
    fn test_fuse_both_immediate() {
        let peer = [beacon("u:1:1", DistanceRange::Immediate)];
        let mine = [beacon("U:1:1", DistanceRange::Immediate)];
        assert_eq!(fuse_distance(&peer, &mine), DistanceRange::Immediate);
    }

    #[test]
    fn test_fuse_close_peer_takes_closer_reading() {
        let peer = [beacon("b", DistanceRange::NextTo)];
        let mine = [beacon("b", DistanceRange::Immediate)];
        assert_eq!(fuse_distance(&peer, &mine), DistanceRange::Immediate);

        let mine_far = [beacon("b", DistanceRange::Far)];
        assert_eq!(fuse_distance(&peer, &mine_far), DistanceRange::NextTo);
    }

    #[test]
    fn test_fuse_far_peer_needs_us_close() {
        let peer = [beacon("b", DistanceRange::Near)];
        let mine_close = [beacon("b", DistanceRange::NextTo)];
        assert_eq!(fuse_distance(&peer, &mine_close), DistanceRange::Near);

        let mine_far = [beacon("b", DistanceRange::Near)];
        assert_eq!(fuse_distance(&peer, &mine_far), DistanceRange::SameBeacon);
    }

    #[test]
    fn test_fuse_keeps_best_over_multiple_beacons() {
        let peer = [
            beacon("a", DistanceRange::Far),
            beacon("b", DistanceRange::NextTo),
        ];
        let mine = [
            beacon("a", DistanceRange::Immediate),
            beacon("b", DistanceRange::NextTo),
        ];
        assert_eq!(fuse_distance(&peer, &mine), DistanceRange::NextTo);
    }
}
