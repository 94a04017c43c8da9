//! Subscription and event evaluation engine.
//!
//! [`ProximityEngine`] owns the three subscription registries, the local
//! entity, the last-seen beacon cache and the check-out timers. Inbound
//! facts are turned into evaluation tasks on a pausable [`Scheduler`];
//! subscription changes pause the scheduler, so no task ever observes a
//! registry mid-update. Each task reads the registries once, at start.

mod beacons;
mod evaluation;
mod facts;
mod sync;

pub use beacons::BeaconReading;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::distance::DistanceRange;
use crate::entity::{Entity, EntityId};
use crate::error::{ExecutionError, ProxResult, ValidationError};
use crate::events::{ErrorEvent, SubscriptionCallback};
use crate::group::Group;
use crate::message::{Channel, Message, MessageBody};
use crate::poi::Poi;
use crate::policy::{AdvertisePolicy, PolicyState};
use crate::runtime::{DeferredTasks, Scheduler, SchedulerConfig};
use crate::stream::{EventStream, DEFAULT_STREAM_CAPACITY};
use crate::subscription::Subscription;
use crate::transport::Transport;

use beacons::LastSeenBeacons;
use evaluation::Notifier;
use sync::PendingQuery;

/// Default number of concurrent geofence subscriptions.
pub const DEFAULT_GEOFENCE_SUBSCRIPTION_LIMIT: usize = 5;

/// Default number of beacon scans between two beacon reports.
pub const DEFAULT_BEACON_REPORT_INTERVAL: u32 = 6;

/// Default grace period before an unconfirmed check-out fires.
pub const DEFAULT_CHECKOUT_GRACE: Duration = Duration::from_secs(30);

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Evaluation worker pool.
    pub scheduler: SchedulerConfig,
    /// Delay before a `CHECK_OUT` with `valid = false` is confirmed.
    #[serde(rename = "checkout_grace_ms", with = "crate::runtime::duration_ms")]
    pub checkout_grace: Duration,
    /// Maximum concurrent geofence subscriptions.
    pub geofence_subscription_limit: usize,
    /// Publish a beacon report every this many scans.
    pub beacon_report_interval: u32,
    /// Buffer size of the stream built by [`ProximityEngine::with_event_stream`].
    pub event_queue_capacity: usize,
    /// Initial advertising policy.
    pub advertise: AdvertisePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            checkout_grace: DEFAULT_CHECKOUT_GRACE,
            geofence_subscription_limit: DEFAULT_GEOFENCE_SUBSCRIPTION_LIMIT,
            beacon_report_interval: DEFAULT_BEACON_REPORT_INTERVAL,
            event_queue_capacity: DEFAULT_STREAM_CAPACITY,
            advertise: AdvertisePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Checkout(EntityId),
    SyncQuery,
}

struct EngineState {
    self_entity: Entity,
    proximity: Vec<Subscription>,
    geofence: Vec<Subscription>,
    group: Vec<Subscription>,
    callback: Option<Arc<dyn SubscriptionCallback>>,
    pois: Vec<Poi>,
}

/// What an evaluation task sees: one consistent read of the registries.
struct Snapshot {
    self_entity: Entity,
    proximity: Vec<Subscription>,
    geofence: Vec<Subscription>,
    group: Vec<Subscription>,
    callback: Option<Arc<dyn SubscriptionCallback>>,
}

impl Snapshot {
    fn notifier(&self, log_id: &str) -> Notifier {
        Notifier::new(self.callback.clone(), log_id)
    }
}

struct Inner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    timers: DeferredTasks<TimerKey>,
    state: RwLock<EngineState>,
    beacons: LastSeenBeacons,
    query: Mutex<Option<PendingQuery>>,
    scan_counter: AtomicU32,
    policy: Mutex<PolicyState>,
    stopped: AtomicBool,
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> MutexGuard<'_, PolicyState> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advertise(&self) -> AdvertisePolicy {
        self.policy().current()
    }

    fn self_entity(&self) -> Entity {
        self.read_state().self_entity.clone()
    }

    fn snapshot(&self) -> Snapshot {
        let st = self.read_state();
        Snapshot {
            self_entity: st.self_entity.clone(),
            proximity: st.proximity.clone(),
            geofence: st.geofence.clone(),
            group: st.group.clone(),
            callback: st.callback.clone(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn new_log_id(&self) -> String {
        format!("{}{}", self.read_state().self_entity.id, Utc::now().timestamp_millis())
    }

    /// Runs `task` on the evaluation pool.
    fn spawn<F>(self: &Arc<Self>, label: &'static str, task: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        let inner = Arc::clone(self);
        match self.scheduler.schedule(move || task(&inner)) {
            Ok(()) => debug!(task = label, "evaluation task scheduled"),
            Err(err) => warn!(task = label, error = %err, "evaluation task rejected"),
        }
    }

    fn publish(&self, channel: &Channel, body: MessageBody, log_id: impl Into<String>) {
        let sender = self.read_state().self_entity.id.clone();
        let message = Message::new(sender, log_id, body);
        match self.transport.publish(channel, &message) {
            Ok(()) => debug!(
                channel = %channel,
                kind = message.kind(),
                log_id = %message.log_id,
                "message published"
            ),
            Err(err) => warn!(
                channel = %channel,
                kind = message.kind(),
                error = %err,
                "publish failed"
            ),
        }
    }

    fn subscribe_topics(&self, self_id: &EntityId) {
        let channels = Channel::shared()
            .into_iter()
            .chain(std::iter::once(Channel::Entity(self_id.clone())));
        for channel in channels {
            if let Err(err) = self.transport.subscribe(&channel) {
                warn!(channel = %channel, error = %err, "subscribe failed");
            }
        }
    }

    fn can_anchor(&self, entity: &Entity) -> bool {
        entity.is_beacon() || entity.id == self.read_state().self_entity.id
    }

    fn report_error(&self, subscription: &Subscription, error: ErrorEvent) {
        let callback = self.read_state().callback.clone();
        warn!(subscription = %subscription, error = %error, "subscription rejected");
        if let Some(cb) = callback {
            cb.on_subscription_error(subscription, error);
        }
    }

    /// Swaps the local entity behind the pause barrier.
    ///
    /// The transport reconnect completes before the swap; if it fails the
    /// old entity stays in place.
    fn replace_self(&self, new_self: Entity, announce: bool) -> ProxResult<()> {
        let _paused = self.scheduler.pause_guard();
        let old = self.self_entity();
        self.transport.reconnect(&new_self)?;

        if announce && self.advertise().group_changes_enabled {
            let log_id = self.new_log_id();
            self.publish(
                &Channel::Group,
                MessageBody::PropertiesUpdate {
                    entity: new_self.clone(),
                    old_properties: old.properties().clone(),
                },
                log_id,
            );
        }
        self.subscribe_topics(&new_self.id);
        info!(entity_id = %new_self.id, announce, "self entity updated");
        self.write_state().self_entity = new_self;
        Ok(())
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.stop();
        self.timers.stop();
        let abandoned = self.query.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(query) = abandoned {
            debug!(topic = %query.topic, "outstanding proximity query abandoned");
        }
        if let Err(err) = self.transport.disconnect() {
            warn!(error = %err, "transport disconnect failed");
        }
        info!("proximity engine stopped");
    }
}

/// The proximity-awareness engine of one node.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use proxmesh::{EngineConfig, Entity, EntityType, Group, InMemoryTransport, ProximityEngine};
///
/// let me = Entity::new("phone-a", EntityType::Device);
/// let transport = Arc::new(InMemoryTransport::new());
/// let (engine, events) =
///     ProximityEngine::with_event_stream(me.clone(), transport, EngineConfig::default()).unwrap();
///
/// let sub = engine.subscribe_group_changes(Group::new("everyone"));
/// assert!(engine.unsubscribe(&sub));
/// assert!(events.is_empty());
/// ```
pub struct ProximityEngine {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProximityEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.read_state();
        f.debug_struct("ProximityEngine")
            .field("self_entity", &st.self_entity.id)
            .field("proximity", &st.proximity.len())
            .field("geofence", &st.geofence.len())
            .field("group", &st.group.len())
            .field("stopped", &self.inner.is_stopped())
            .finish()
    }
}

impl ProximityEngine {
    /// Creates an engine for `self_entity` publishing through `transport`.
    ///
    /// Events are discarded until a callback is installed.
    pub fn new(
        self_entity: Entity,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> ProxResult<Self> {
        if self_entity.id.is_empty() {
            return Err(ValidationError::EmptyEntityId.into());
        }

        let scheduler = Scheduler::new("proxmesh", config.scheduler.clone());
        let timers = DeferredTasks::new("proxmesh")?;
        let policy = PolicyState::new(config.advertise);
        info!(entity_id = %self_entity.id, "proximity engine started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                scheduler,
                timers,
                state: RwLock::new(EngineState {
                    self_entity,
                    proximity: Vec::new(),
                    geofence: Vec::new(),
                    group: Vec::new(),
                    callback: None,
                    pois: Vec::new(),
                }),
                beacons: LastSeenBeacons::default(),
                query: Mutex::new(None),
                scan_counter: AtomicU32::new(0),
                policy: Mutex::new(policy),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Creates an engine delivering into a fresh [`EventStream`] sized by
    /// `config.event_queue_capacity`.
    pub fn with_event_stream(
        self_entity: Entity,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> ProxResult<(Self, Arc<EventStream>)> {
        let stream = Arc::new(EventStream::new(config.event_queue_capacity));
        let engine = Self::new(self_entity, transport, config)?;
        engine.set_callback(Some(Arc::clone(&stream) as Arc<dyn SubscriptionCallback>));
        Ok((engine, stream))
    }

    /// Replaces the event sink. `None` turns every delivery into a no-op.
    pub fn set_callback(&self, callback: Option<Arc<dyn SubscriptionCallback>>) {
        let _paused = self.inner.scheduler.pause_guard();
        self.inner.write_state().callback = callback;
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The local entity.
    #[must_use]
    pub fn self_entity(&self) -> Entity {
        self.inner.self_entity()
    }

    /// Proximity events between `e1` and members of `g2`.
    ///
    /// `e1` must be a beacon or the local entity; otherwise `NotValid` is
    /// reported and no subscription is created.
    pub fn subscribe_entity_distance_tracking(&self, e1: &Entity, g2: Group) -> Option<Subscription> {
        let subscription = Subscription::proximity(Group::single(e1), g2);
        if !self.inner.can_anchor(e1) {
            self.inner.report_error(&subscription, ErrorEvent::NotValid);
            return None;
        }

        {
            let _paused = self.inner.scheduler.pause_guard();
            self.inner.write_state().proximity.push(subscription.clone());
        }
        info!(subscription = %subscription, "proximity subscription added");
        Some(subscription)
    }

    /// Geofence entry/exit of `g` members around `e1`, inclusive of `distance`.
    ///
    /// Same anchoring rule as distance tracking. Rejected with
    /// `NumberLimitExceeded` once the geofence limit is reached.
    pub fn subscribe_entity_geofence_tracking(
        &self,
        e1: &Entity,
        g: Group,
        distance: DistanceRange,
    ) -> Option<Subscription> {
        let subscription = Subscription::geofence(e1.clone(), g, distance);
        if !self.inner.can_anchor(e1) {
            self.inner.report_error(&subscription, ErrorEvent::NotValid);
            return None;
        }

        let added = {
            let _paused = self.inner.scheduler.pause_guard();
            let mut st = self.inner.write_state();
            if st.geofence.len() >= self.inner.config.geofence_subscription_limit {
                false
            } else {
                st.geofence.push(subscription.clone());
                true
            }
        };

        if !added {
            self.inner.report_error(&subscription, ErrorEvent::NumberLimitExceeded);
            return None;
        }
        info!(subscription = %subscription, "geofence subscription added");
        Some(subscription)
    }

    /// Check-in/out and join/leave events for members of `g`.
    pub fn subscribe_group_changes(&self, g: Group) -> Subscription {
        let subscription = Subscription::group(g);
        {
            let _paused = self.inner.scheduler.pause_guard();
            self.inner.write_state().group.push(subscription.clone());
        }
        info!(subscription = %subscription, "group subscription added");
        subscription
    }

    /// Removes the first registered subscription equal to `subscription`.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = {
            let _paused = self.inner.scheduler.pause_guard();
            let mut st = self.inner.write_state();
            let st = &mut *st;
            #[allow(clippy::let_and_return)]
            let found = [&mut st.group, &mut st.proximity, &mut st.geofence]
                .into_iter()
                .any(|list| match list.iter().position(|s| s == subscription) {
                    Some(pos) => {
                        list.remove(pos);
                        true
                    }
                    None => false,
                });
            found
        };

        if removed {
            info!(subscription = %subscription, "subscription removed");
        } else {
            debug!(subscription = %subscription, "unsubscribe found nothing");
        }
        removed
    }

    /// All registered subscriptions: group, then proximity, then geofence.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let st = self.inner.read_state();
        st.group
            .iter()
            .chain(&st.proximity)
            .chain(&st.geofence)
            .cloned()
            .collect()
    }

    /// Announces the local entity after the transport connected.
    pub fn on_connected(&self) {
        let me = self.inner.self_entity();
        if self.inner.advertise().group_changes_enabled {
            let log_id = self.inner.new_log_id();
            self.inner
                .publish(&Channel::Broadcast, MessageBody::CheckIn { entity: me.clone() }, log_id);
        }
        self.inner.subscribe_topics(&me.id);
        info!(entity_id = %me.id, "connected");
    }

    /// Feeds one inbound fact to the evaluators.
    pub fn handle_message(&self, message: Message) {
        self.inner.handle_message(message);
    }

    /// Decodes and handles a raw inbound payload.
    ///
    /// Oversized or undecodable payloads are logged and dropped. Returns
    /// whether the payload was accepted.
    pub fn handle_payload(&self, payload: &[u8]) -> bool {
        self.inner.handle_payload(payload)
    }

    /// Processes one BLE ranging result.
    pub fn on_beacon_scan(&self, readings: &[BeaconReading]) {
        self.inner.on_beacon_scan(readings);
    }

    /// Copy of the last-seen beacon cache.
    #[must_use]
    pub fn last_seen_beacons(&self) -> Vec<Entity> {
        self.inner.beacons.snapshot()
    }

    /// Starts a network query for entities matching `group` within
    /// `max_distance`.
    ///
    /// Replies are collected for `timeout`; cached beacons within range are
    /// then appended and `on_complete` runs once with the result. Returns
    /// false, without side effects, while another query is outstanding.
    pub fn get_all_entities_in_proximity<F>(
        &self,
        max_distance: DistanceRange,
        group: Group,
        timeout: Duration,
        on_complete: F,
    ) -> bool
    where
        F: FnOnce(Vec<Entity>) + Send + 'static,
    {
        self.inner.start_query(max_distance, group, timeout, on_complete)
    }

    /// Returns true while a proximity query is collecting replies.
    #[must_use]
    pub fn is_query_pending(&self) -> bool {
        self.inner.query.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Returns true while a check-out for `id` waits for its grace period.
    #[must_use]
    pub fn is_checkout_pending(&self, id: &EntityId) -> bool {
        self.inner.timers.is_pending(&TimerKey::Checkout(id.clone()))
    }

    /// Replaces the local entity's properties.
    ///
    /// The id must not change. Reconnects the transport, announces the
    /// change when group advertising is on, then swaps the entity.
    pub fn update_self_entity(&self, new_self: Entity) -> ProxResult<()> {
        let current = self.inner.self_entity().id;
        if new_self.id != current {
            return Err(ExecutionError::SelfIdentityChanged {
                current,
                requested: new_self.id,
            }
            .into());
        }
        self.inner.replace_self(new_self, true)
    }

    /// Stops advertising. Returns false if ghost mode was already on.
    pub fn enable_ghost_mode(&self) -> ProxResult<bool> {
        let Some(previous) = self.inner.policy().enter_ghost() else {
            return Ok(false);
        };
        let me = self.inner.self_entity();
        if previous.group_changes_enabled {
            let log_id = self.inner.new_log_id();
            self.inner.publish(
                &Channel::Broadcast,
                MessageBody::CheckOut {
                    entity: me.clone(),
                    valid: true,
                },
                log_id,
            );
        }
        info!(entity_id = %me.id, "ghost mode enabled");
        self.inner.replace_self(me, false)?;
        Ok(true)
    }

    /// Restores the advertising policy saved by
    /// [`enable_ghost_mode`](Self::enable_ghost_mode). Returns false if ghost
    /// mode was off.
    pub fn disable_ghost_mode(&self) -> ProxResult<bool> {
        let Some(restored) = self.inner.policy().leave_ghost() else {
            return Ok(false);
        };
        let me = self.inner.self_entity();
        if restored.group_changes_enabled {
            let log_id = self.inner.new_log_id();
            self.inner
                .publish(&Channel::Broadcast, MessageBody::CheckIn { entity: me.clone() }, log_id);
        }
        info!(entity_id = %me.id, "ghost mode disabled");
        self.inner.replace_self(me, false)?;
        Ok(true)
    }

    #[must_use]
    pub fn is_ghost_mode(&self) -> bool {
        self.inner.policy().is_ghost()
    }

    #[must_use]
    pub fn advertise_policy(&self) -> AdvertisePolicy {
        self.inner.advertise()
    }

    /// Sets the advertising policy. Ignored while ghost mode is on.
    pub fn set_advertise_policy(&self, policy: AdvertisePolicy) {
        let mut state = self.inner.policy();
        if state.is_ghost() {
            debug!("advertise policy change ignored in ghost mode");
            return;
        }
        state.set(policy);
    }

    /// Registers points of interest from a JSON array. Returns how many were added.
    pub fn add_pois(&self, json: &str) -> ProxResult<usize> {
        let pois = Poi::parse_list(json)?;
        let added = pois.len();
        let mut st = self.inner.write_state();
        st.pois.extend(pois);
        info!(added, total = st.pois.len(), "points of interest registered");
        Ok(added)
    }

    #[must_use]
    pub fn pois(&self) -> Vec<Poi> {
        self.inner.read_state().pois.clone()
    }

    /// Forwards an OS region notification for a registered point of interest.
    ///
    /// Returns false if `region` names no registered point of interest.
    pub fn on_region_transition(&self, region: &str, entered: bool) -> bool {
        let (me, poi, callback) = {
            let st = self.inner.read_state();
            let Some(poi) = st.pois.iter().find(|p| p.name == region).cloned() else {
                warn!(region, "transition for unknown region ignored");
                return false;
            };
            (st.self_entity.clone(), poi, st.callback.clone())
        };

        debug!(region, entered, "point of interest transition");
        if let Some(cb) = callback {
            cb.on_poi_event(&me, &poi, entered);
        }
        true
    }

    /// Waits until every queued evaluation task has run.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.scheduler.wait_idle(timeout)
    }

    /// Evaluation tasks that panicked.
    #[must_use]
    pub fn panicked_tasks(&self) -> u64 {
        self.inner.scheduler.panicked_tasks()
    }

    /// Stops evaluation, drops pending timers and disconnects. Idempotent.
    ///
    /// An outstanding proximity query is abandoned without calling back.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }
}

impl Drop for ProximityEngine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
