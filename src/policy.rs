//! Advertising policy.
//!
//! Controls what the local engine tells the network about itself. Ghost mode
//! turns both flags off and remembers the previous setting so it can be
//! restored.

use serde::{Deserialize, Serialize};

/// What the local entity advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisePolicy {
    /// Publish check-in/out and property updates.
    pub group_changes_enabled: bool,
    /// Publish beacon reports and per-peer proximity updates.
    pub proximity_changes_enabled: bool,
}

impl Default for AdvertisePolicy {
    fn default() -> Self {
        Self {
            group_changes_enabled: true,
            proximity_changes_enabled: true,
        }
    }
}

impl AdvertisePolicy {
    /// Advertises nothing.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            group_changes_enabled: false,
            proximity_changes_enabled: false,
        }
    }
}

/// Live policy plus the setting saved while ghost mode is on.
#[derive(Debug, Clone, Default)]
pub(crate) struct PolicyState {
    current: AdvertisePolicy,
    saved: Option<AdvertisePolicy>,
}

impl PolicyState {
    pub(crate) fn new(policy: AdvertisePolicy) -> Self {
        Self {
            current: policy,
            saved: None,
        }
    }

    pub(crate) const fn current(&self) -> AdvertisePolicy {
        self.current
    }

    pub(crate) fn set(&mut self, policy: AdvertisePolicy) {
        self.current = policy;
    }

    pub(crate) const fn is_ghost(&self) -> bool {
        self.saved.is_some()
    }

    /// Enters ghost mode, returning the policy in force before.
    ///
    /// Returns `None` if ghost mode was already on.
    pub(crate) fn enter_ghost(&mut self) -> Option<AdvertisePolicy> {
        if self.saved.is_some() {
            return None;
        }
        let previous = self.current;
        self.saved = Some(previous);
        self.current = AdvertisePolicy::silent();
        Some(previous)
    }

    /// Leaves ghost mode, restoring and returning the saved policy.
    pub(crate) fn leave_ghost(&mut self) -> Option<AdvertisePolicy> {
        let restored = self.saved.take()?;
        self.current = restored;
        Some(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_advertises_everything() {
        let p = AdvertisePolicy::default();
        assert!(p.group_changes_enabled);
        assert!(p.proximity_changes_enabled);
    }

    #[test]
    fn test_ghost_round_trip_restores_previous() {
        let custom = AdvertisePolicy {
            group_changes_enabled: true,
            proximity_changes_enabled: false,
        };
        let mut state = PolicyState::new(custom);
        assert_eq!(state.enter_ghost(), Some(custom));
        assert!(state.is_ghost());
        assert_eq!(state.current(), AdvertisePolicy::silent());
        assert_eq!(state.enter_ghost(), None);
        assert_eq!(state.leave_ghost(), Some(custom));
        assert_eq!(state.current(), custom);
        assert_eq!(state.leave_ghost(), None);
    }

    #[test]
    fn test_deserialize_fills_missing_flags() {
        let p: AdvertisePolicy = serde_json::from_str(r#"{"proximity_changes_enabled": false}"#).unwrap();
        assert!(p.group_changes_enabled);
        assert!(!p.proximity_changes_enabled);
    }
}
