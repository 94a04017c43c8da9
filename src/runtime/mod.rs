//! Thread-based runtime for fact evaluation.
//!
//! Two small pieces: a pausable worker pool that runs evaluation tasks, and a
//! timer thread for cancellable deferred tasks. Neither depends on the rest
//! of the crate.

pub mod scheduler;
pub mod timer;

pub use scheduler::{Scheduler, SchedulerConfig};
pub use timer::DeferredTasks;

/// Serde helper encoding a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
