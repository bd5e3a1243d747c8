/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::diagnostics::FeedMetrics;
use crate::events::{FeedEvents, SparkEvent, UserEvent};
use crate::store::{ChangeEvent, KeyValueStore, StorePath};
use crate::timeline::{Spark, TimelineId};
use crate::users::{user_path, UserProfile};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Logical identifier of a live stream. Concurrent observers of the same key
/// share one underlying store registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    LatestSparks,
    Timeline(String),
    UserInfo(String),
    Followers(String),
    Followees(String),
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::LatestSparks => write!(f, "latest"),
            StreamKey::Timeline(u) => write!(f, "timeline:{u}"),
            StreamKey::UserInfo(u) => write!(f, "userinfo:{u}"),
            StreamKey::Followers(u) => write!(f, "followers:{u}"),
            StreamKey::Followees(u) => write!(f, "followees:{u}"),
        }
    }
}

enum WatchScope {
    /// Children of a prefix (timelines, follower lists).
    Collection(StorePath),
    /// A single document (a user profile).
    Document(StorePath),
}

impl StreamKey {
    fn scope(&self) -> WatchScope {
        match self {
            StreamKey::LatestSparks => WatchScope::Collection(TimelineId::Latest.path()),
            StreamKey::Timeline(u) => {
                WatchScope::Collection(TimelineId::User(u.clone()).path())
            }
            StreamKey::UserInfo(u) => WatchScope::Document(user_path(u)),
            StreamKey::Followers(u) => {
                WatchScope::Collection(crate::follow_graph::followers_path(u))
            }
            StreamKey::Followees(u) => {
                WatchScope::Collection(crate::follow_graph::followees_path(u))
            }
        }
    }

    fn timeline_id(&self) -> Option<TimelineId> {
        match self {
            StreamKey::LatestSparks => Some(TimelineId::Latest),
            StreamKey::Timeline(u) => Some(TimelineId::User(u.clone())),
            _ => None,
        }
    }

    fn added_event(&self, child: &str, value: &Value) -> Option<StreamEvent> {
        match self {
            StreamKey::LatestSparks | StreamKey::Timeline(_) => {
                let spark: Spark = serde_json::from_value(value.clone()).ok()?;
                Some(StreamEvent::SparkAdded {
                    timeline: self.timeline_id()?,
                    spark,
                })
            }
            StreamKey::UserInfo(_) => {
                let profile: UserProfile = serde_json::from_value(value.clone()).ok()?;
                Some(StreamEvent::UserUpdated(profile))
            }
            StreamKey::Followers(u) => Some(StreamEvent::FollowerAdded {
                followee: u.clone(),
                follower: child.to_string(),
            }),
            StreamKey::Followees(u) => Some(StreamEvent::FolloweeAdded {
                follower: u.clone(),
                followee: child.to_string(),
            }),
        }
    }

    fn removed_event(&self, child: &str, old: &Value) -> Option<StreamEvent> {
        match self {
            StreamKey::LatestSparks | StreamKey::Timeline(_) => {
                let spark: Spark = serde_json::from_value(old.clone()).ok()?;
                Some(StreamEvent::SparkRemoved {
                    timeline: self.timeline_id()?,
                    spark,
                })
            }
            // Profiles are never hard-deleted; a removal here is not a
            // domain event.
            StreamKey::UserInfo(_) => None,
            StreamKey::Followers(u) => Some(StreamEvent::FollowerRemoved {
                followee: u.clone(),
                follower: child.to_string(),
            }),
            StreamKey::Followees(u) => Some(StreamEvent::FolloweeRemoved {
                follower: u.clone(),
                followee: child.to_string(),
            }),
        }
    }
}

/// What an observer of a stream receives: a replay of the current state as
/// synthetic additions, then live deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    SparkAdded { timeline: TimelineId, spark: Spark },
    SparkRemoved { timeline: TimelineId, spark: Spark },
    UserUpdated(UserProfile),
    FollowerAdded { followee: String, follower: String },
    FollowerRemoved { followee: String, follower: String },
    FolloweeAdded { follower: String, followee: String },
    FolloweeRemoved { follower: String, followee: String },
}

/// Opaque ticket returned by `subscribe`; pass it back to `unsubscribe`.
/// The registry has no view of observer lifetime beyond this: a handle that
/// is never returned keeps the underlying registration alive for good.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    key: StreamKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscription registry is closed")]
    Closed,
    #[error("no user is logged in")]
    NotLoggedIn,
}

enum PumpCtl {
    Attach {
        observer: u64,
        tx: mpsc::UnboundedSender<StreamEvent>,
    },
    Detach {
        observer: u64,
    },
    Stop,
}

struct StreamState {
    key: StreamKey,
    refcount: usize,
    ctl: mpsc::UnboundedSender<PumpCtl>,
    task: tokio::task::JoinHandle<()>,
}

struct Inner {
    closed: bool,
    streams: HashMap<String, StreamState>,
    handles: HashMap<u64, String>,
}

/// Refcounted live streams over the store. At most one store-level watch
/// exists per stream key, no matter how many observers attach; the watch is
/// torn down when the last observer leaves. All teardown paths are no-ops
/// when repeated.
pub struct SubscriptionRegistry {
    store: Arc<dyn KeyValueStore>,
    events: FeedEvents,
    metrics: Arc<FeedMetrics>,
    seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        events: FeedEvents,
        metrics: Arc<FeedMetrics>,
    ) -> Self {
        Self {
            store,
            events,
            metrics,
            seq: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                closed: false,
                streams: HashMap::new(),
                handles: HashMap::new(),
            }),
        }
    }

    /// Attaches an observer to `key`, starting the underlying registration if
    /// this is the first one. The receiver first replays the current state as
    /// synthetic additions, then carries live deltas. After `unsubscribe` no
    /// further events are delivered, even if store callbacks arrive late.
    pub fn subscribe(
        &self,
        key: StreamKey,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<StreamEvent>), SubscriptionError>
    {
        let mut inner = self.inner.lock().expect("registry poisoned");
        if inner.closed {
            return Err(SubscriptionError::Closed);
        }
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let key_str = key.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let state = inner.streams.entry(key_str.clone()).or_insert_with(|| {
            let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_pump(
                key.clone(),
                self.store.clone(),
                self.events.clone(),
                self.metrics.clone(),
                ctl_rx,
            ));
            self.metrics.stream_opened();
            debug!("stream {key_str}: opened");
            StreamState {
                key: key.clone(),
                refcount: 0,
                ctl: ctl_tx,
                task,
            }
        });
        state.refcount += 1;
        let _ = state.ctl.send(PumpCtl::Attach { observer: id, tx });
        inner.handles.insert(id, key_str);
        Ok((SubscriptionHandle { id, key }, rx))
    }

    /// Detaches one observer. Unknown or already-returned handles are
    /// ignored; this never fails and never double-frees.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let Some(key_str) = inner.handles.remove(&handle.id) else {
            return;
        };
        let Some(state) = inner.streams.get_mut(&key_str) else {
            return;
        };
        let _ = state.ctl.send(PumpCtl::Detach { observer: handle.id });
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            let state = inner.streams.remove(&key_str).expect("entry just seen");
            let _ = state.ctl.send(PumpCtl::Stop);
            self.metrics.stream_closed();
            debug!("stream {key_str}: closed");
        }
    }

    /// Active streams and their observer counts.
    pub fn list_active(&self) -> Vec<(StreamKey, usize)> {
        let inner = self.inner.lock().expect("registry poisoned");
        let mut out: Vec<_> = inner
            .streams
            .values()
            .map(|s| (s.key.clone(), s.refcount))
            .collect();
        out.sort_by_key(|(k, _)| k.to_string());
        out
    }

    /// Force-closes every stream regardless of refcount and refuses new
    /// subscriptions from then on. A `subscribe` ordered after this call can
    /// never leak a registration: both take the same lock.
    pub fn teardown_all(&self) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.closed = true;
        for (key_str, state) in inner.streams.drain() {
            let _ = state.ctl.send(PumpCtl::Stop);
            state.task.abort();
            debug!("stream {key_str}: torn down");
        }
        inner.handles.clear();
        self.metrics.streams_reset();
    }
}

async fn run_pump(
    key: StreamKey,
    store: Arc<dyn KeyValueStore>,
    events: FeedEvents,
    metrics: Arc<FeedMetrics>,
    mut ctl: mpsc::UnboundedReceiver<PumpCtl>,
) {
    let scope = key.scope();
    // Watch before reading the snapshot so no committed change falls between
    // the two; a change that lands in both shows up as a duplicate delta and
    // is suppressed against the view below.
    let mut changes = store.watch();
    let mut view: BTreeMap<String, Value> = BTreeMap::new();
    load_view(&store, &scope, &mut view).await;

    let mut observers: HashMap<u64, mpsc::UnboundedSender<StreamEvent>> = HashMap::new();
    loop {
        tokio::select! {
            // Control first: a detach queued before a delta must win, so an
            // observer that unsubscribed never sees that delta.
            biased;
            msg = ctl.recv() => match msg {
                Some(PumpCtl::Attach { observer, tx }) => {
                    for (child, value) in &view {
                        if let Some(ev) = key.added_event(child, value) {
                            let _ = tx.send(ev);
                        }
                    }
                    observers.insert(observer, tx);
                }
                Some(PumpCtl::Detach { observer }) => {
                    observers.remove(&observer);
                }
                Some(PumpCtl::Stop) | None => break,
            },
            res = changes.recv() => match res {
                Ok(ev) => {
                    apply_delta(&key, &scope, ev, &mut view, &mut observers, &events, &metrics);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("stream {key}: missed {n} change events, resyncing");
                    resync(&key, &store, &scope, &mut view, &mut observers, &events, &metrics)
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn scoped_child(scope: &WatchScope, path: &StorePath) -> Option<String> {
    match scope {
        WatchScope::Collection(prefix) if path.is_direct_child_of(prefix) => {
            Some(path.key().to_string())
        }
        WatchScope::Document(doc) if path == doc => Some(path.key().to_string()),
        _ => None,
    }
}

async fn load_view(
    store: &Arc<dyn KeyValueStore>,
    scope: &WatchScope,
    view: &mut BTreeMap<String, Value>,
) {
    match scope {
        WatchScope::Collection(prefix) => match store.list(prefix).await {
            Ok(entries) => view.extend(entries),
            Err(e) => warn!("stream snapshot at {prefix} failed: {e}"),
        },
        WatchScope::Document(doc) => match store.read(doc).await {
            Ok(Some(value)) => {
                view.insert(doc.key().to_string(), value);
            }
            Ok(None) => {}
            Err(e) => warn!("stream snapshot at {doc} failed: {e}"),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_delta(
    key: &StreamKey,
    scope: &WatchScope,
    ev: ChangeEvent,
    view: &mut BTreeMap<String, Value>,
    observers: &mut HashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
    events: &FeedEvents,
    metrics: &FeedMetrics,
) {
    let Some(child) = scoped_child(scope, &ev.path) else {
        return;
    };
    let stream_event = match ev.value {
        Some(value) => {
            if view.get(&child) == Some(&value) {
                return; // snapshot/watch overlap
            }
            let ev = key.added_event(&child, &value);
            view.insert(child, value);
            ev
        }
        None => {
            let Some(old) = view.remove(&child) else {
                return;
            };
            key.removed_event(&child, &old)
        }
    };
    if let Some(stream_event) = stream_event {
        deliver(key, stream_event, observers, events, metrics);
    }
}

/// Fans one delta out to every observer and publishes the matching domain
/// event exactly once, regardless of observer count. Replay never reaches
/// the domain channels; only live deltas do.
fn deliver(
    key: &StreamKey,
    ev: StreamEvent,
    observers: &mut HashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
    events: &FeedEvents,
    metrics: &FeedMetrics,
) {
    observers.retain(|_, tx| tx.send(ev.clone()).is_ok());
    match &ev {
        StreamEvent::SparkAdded { timeline, spark } => events.publish_spark(SparkEvent::Added {
            timeline: timeline.clone(),
            spark: spark.clone(),
        }),
        StreamEvent::SparkRemoved { timeline, spark } => {
            events.publish_spark(SparkEvent::Overflowed {
                timeline: timeline.clone(),
                spark: spark.clone(),
            })
        }
        StreamEvent::UserUpdated(profile) => {
            events.publish_user(UserEvent::Updated(profile.clone()))
        }
        // Follow domain events are emitted by the graph manager at the point
        // of mutation; re-publishing list deltas here would duplicate them.
        _ => {}
    }
    metrics.event_published();
    debug!("stream {key}: delivered {ev:?}");
}

#[allow(clippy::too_many_arguments)]
async fn resync(
    key: &StreamKey,
    store: &Arc<dyn KeyValueStore>,
    scope: &WatchScope,
    view: &mut BTreeMap<String, Value>,
    observers: &mut HashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
    events: &FeedEvents,
    metrics: &FeedMetrics,
) {
    let mut fresh = BTreeMap::new();
    load_view(store, scope, &mut fresh).await;

    let stale: Vec<String> = view
        .keys()
        .filter(|k| !fresh.contains_key(*k))
        .cloned()
        .collect();
    for child in stale {
        if let Some(old) = view.remove(&child) {
            if let Some(ev) = key.removed_event(&child, &old) {
                deliver(key, ev, observers, events, metrics);
            }
        }
    }
    for (child, value) in fresh {
        if view.get(&child) != Some(&value) {
            if let Some(ev) = key.added_event(&child, &value) {
                deliver(key, ev, observers, events, metrics);
            }
            view.insert(child, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Wrapper that counts how many store-level watch registrations exist.
    struct CountingStore {
        inner: SqliteStore,
        watches: AtomicU64,
    }

    #[async_trait]
    impl KeyValueStore for CountingStore {
        async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
            self.inner.write(path, value).await
        }
        async fn remove(&self, path: &StorePath) -> Result<bool, StoreError> {
            self.inner.remove(path).await
        }
        async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
            self.inner.read(path).await
        }
        async fn write_batch(
            &self,
            ops: Vec<(StorePath, Option<Value>)>,
        ) -> Result<(), StoreError> {
            self.inner.write_batch(ops).await
        }
        async fn list(&self, prefix: &StorePath) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.list(prefix).await
        }
        fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
            self.watches.fetch_add(1, Ordering::Relaxed);
            self.inner.watch()
        }
    }

    struct Fixture {
        store: Arc<CountingStore>,
        events: FeedEvents,
        registry: SubscriptionRegistry,
    }

    fn fixture(dir: &tempfile::TempDir) -> Fixture {
        let store = Arc::new(CountingStore {
            inner: SqliteStore::open(dir.path().join("kv.sqlite3"), 256).unwrap(),
            watches: AtomicU64::new(0),
        });
        let events = FeedEvents::new(64);
        let registry = SubscriptionRegistry::new(
            store.clone(),
            events.clone(),
            Arc::new(FeedMetrics::new()),
        );
        Fixture {
            store,
            events,
            registry,
        }
    }

    fn spark_value(id: &str) -> Value {
        json!({
            "spark_id": id,
            "author_id": "u1",
            "text": format!("text {id}"),
            "created_at_ms": 0,
        })
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
    ) -> StreamEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn replay_current_state_then_stream_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let prefix = TimelineId::Latest.path();
        f.store.write(&prefix.child("a"), spark_value("a")).await.unwrap();
        f.store.write(&prefix.child("b"), spark_value("b")).await.unwrap();

        let (handle, mut rx) = f.registry.subscribe(StreamKey::LatestSparks).unwrap();
        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert!(matches!(first, StreamEvent::SparkAdded { ref spark, .. } if spark.spark_id == "a"));
        assert!(matches!(second, StreamEvent::SparkAdded { ref spark, .. } if spark.spark_id == "b"));

        f.store.write(&prefix.child("c"), spark_value("c")).await.unwrap();
        let third = recv(&mut rx).await;
        assert!(matches!(third, StreamEvent::SparkAdded { ref spark, .. } if spark.spark_id == "c"));

        f.registry.unsubscribe(&handle);
    }

    #[tokio::test]
    async fn many_observers_share_one_store_registration() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(f.registry.subscribe(StreamKey::LatestSparks).unwrap());
        }
        // Let the single pump start.
        let _ = timeout(Duration::from_millis(200), subs[0].1.recv()).await;
        assert_eq!(f.store.watches.load(Ordering::Relaxed), 1);
        assert_eq!(f.registry.list_active(), vec![(StreamKey::LatestSparks, 5)]);

        for (handle, _rx) in &subs {
            f.registry.unsubscribe(handle);
        }
        assert!(f.registry.list_active().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let (h1, _rx1) = f.registry.subscribe(StreamKey::Timeline("u1".into())).unwrap();
        let (h2, _rx2) = f.registry.subscribe(StreamKey::Timeline("u1".into())).unwrap();

        f.registry.unsubscribe(&h1);
        f.registry.unsubscribe(&h1); // second return of the same handle
        assert_eq!(
            f.registry.list_active(),
            vec![(StreamKey::Timeline("u1".into()), 1)],
            "stale handle must not steal the remaining observer's refcount"
        );
        f.registry.unsubscribe(&h2);
        f.registry.unsubscribe(&h2);
        assert!(f.registry.list_active().is_empty());
    }

    #[tokio::test]
    async fn no_events_after_unsubscribe() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let prefix = TimelineId::Latest.path();
        let (h1, mut rx1) = f.registry.subscribe(StreamKey::LatestSparks).unwrap();
        let (_h2, mut rx2) = f.registry.subscribe(StreamKey::LatestSparks).unwrap();
        f.registry.unsubscribe(&h1);

        f.store.write(&prefix.child("a"), spark_value("a")).await.unwrap();
        // The remaining observer sees the delta...
        let ev = recv(&mut rx2).await;
        assert!(matches!(ev, StreamEvent::SparkAdded { .. }));
        // ...the detached one sees nothing more.
        if let Ok(Some(ev)) = timeout(Duration::from_millis(200), rx1.recv()).await {
            panic!("event delivered after unsubscribe: {ev:?}");
        }
    }

    #[tokio::test]
    async fn one_domain_event_per_mutation_regardless_of_observers() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let prefix = TimelineId::Latest.path();
        f.store.write(&prefix.child("a"), spark_value("a")).await.unwrap();

        let mut domain = f.events.subscribe_sparks();
        let (_h1, mut rx1) = f.registry.subscribe(StreamKey::LatestSparks).unwrap();
        let (_h2, mut rx2) = f.registry.subscribe(StreamKey::LatestSparks).unwrap();
        // Drain replays; replay must not hit the domain channel.
        let _ = recv(&mut rx1).await;
        let _ = recv(&mut rx2).await;
        assert!(domain.try_recv().is_err());

        f.store.write(&prefix.child("b"), spark_value("b")).await.unwrap();
        let _ = recv(&mut rx1).await;
        let _ = recv(&mut rx2).await;
        let ev = domain.try_recv().expect("one domain event");
        assert!(matches!(ev, SparkEvent::Added { ref spark, .. } if spark.spark_id == "b"));
        assert!(domain.try_recv().is_err(), "no duplicate emission");
    }

    #[tokio::test]
    async fn removal_surfaces_as_overflow_with_the_old_value() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let prefix = TimelineId::User("u1".into()).path();
        f.store.write(&prefix.child("a"), spark_value("a")).await.unwrap();

        let (_h, mut rx) = f.registry.subscribe(StreamKey::Timeline("u1".into())).unwrap();
        let _ = recv(&mut rx).await; // replay
        f.store.remove(&prefix.child("a")).await.unwrap();
        let ev = recv(&mut rx).await;
        assert!(
            matches!(ev, StreamEvent::SparkRemoved { ref spark, .. } if spark.spark_id == "a"),
            "removed event must carry the evicted spark, got {ev:?}"
        );
    }

    #[tokio::test]
    async fn user_info_stream_replays_profile_and_streams_updates() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let profile = json!({"user_id": "u1", "display_name": "Alice"});
        f.store.write(&user_path("u1"), profile).await.unwrap();

        let (_h, mut rx) = f.registry.subscribe(StreamKey::UserInfo("u1".into())).unwrap();
        let ev = recv(&mut rx).await;
        assert!(matches!(ev, StreamEvent::UserUpdated(ref p) if p.display_name == "Alice"));

        let updated = json!({"user_id": "u1", "display_name": "Alice B."});
        f.store.write(&user_path("u1"), updated).await.unwrap();
        let ev = recv(&mut rx).await;
        assert!(matches!(ev, StreamEvent::UserUpdated(ref p) if p.display_name == "Alice B."));
        // Writes to other users stay invisible.
        f.store
            .write(&user_path("u2"), json!({"user_id": "u2", "display_name": "Bob"}))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn follower_stream_reports_membership_changes() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let followers = crate::follow_graph::followers_path("hub");
        f.store.write(&followers.child("amy"), json!({"since_ms": 1})).await.unwrap();

        let (_h, mut rx) = f.registry.subscribe(StreamKey::Followers("hub".into())).unwrap();
        let ev = recv(&mut rx).await;
        assert_eq!(
            ev,
            StreamEvent::FollowerAdded {
                followee: "hub".into(),
                follower: "amy".into()
            }
        );

        f.store.remove(&followers.child("amy")).await.unwrap();
        let ev = recv(&mut rx).await;
        assert_eq!(
            ev,
            StreamEvent::FollowerRemoved {
                followee: "hub".into(),
                follower: "amy".into()
            }
        );
    }

    #[tokio::test]
    async fn teardown_closes_everything_and_rejects_new_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir);
        let (_h1, _rx1) = f.registry.subscribe(StreamKey::LatestSparks).unwrap();
        let (_h2, _rx2) = f.registry.subscribe(StreamKey::UserInfo("u1".into())).unwrap();

        f.registry.teardown_all();
        assert!(f.registry.list_active().is_empty());
        assert!(matches!(
            f.registry.subscribe(StreamKey::LatestSparks),
            Err(SubscriptionError::Closed)
        ));
        // Idempotent.
        f.registry.teardown_all();
    }
}
