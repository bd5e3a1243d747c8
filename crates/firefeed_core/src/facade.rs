/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::config::FeedConfig;
use crate::diagnostics::FeedMetrics;
use crate::events::{FeedEvents, SessionEvent};
use crate::fanout::{FanoutEngine, PostError, QueueStats};
use crate::follow_graph::{FollowGraphManager, GraphError};
use crate::store::{KeyValueStore, StoreError};
use crate::subscriptions::{
    StreamEvent, StreamKey, SubscriptionError, SubscriptionHandle, SubscriptionRegistry,
};
use crate::timeline::{Spark, TimelineStore};
use crate::users::{UserDirectory, UserProfile};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

/// Installs the process-wide log subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .try_init()
        .ok();
}

/// A live observation: the opaque handle plus the event receiver. The
/// receiver replays current state first, then streams deltas. Callers MUST
/// hand the handle back to `stop_observing`; the registry has no view of the
/// consumer's lifetime, so a kept handle keeps the underlying registration
/// (and its resources) alive indefinitely.
pub struct ObservedStream {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// The orchestrating surface the application layer talks to. Composes the
/// follow graph, bounded timelines, fan-out engine and subscription registry
/// over one shared store, and emits typed domain events.
///
/// Authentication is a collaborator: `login` receives an
/// already-authenticated profile, there is no credential handling here.
pub struct Firefeed {
    users: UserDirectory,
    graph: Arc<FollowGraphManager>,
    timelines: Arc<TimelineStore>,
    fanout: Arc<FanoutEngine>,
    registry: Arc<SubscriptionRegistry>,
    events: FeedEvents,
    metrics: Arc<FeedMetrics>,
    session: Mutex<Option<UserProfile>>,
    shutdown: watch::Sender<bool>,
}

impl Firefeed {
    /// `data_dir` hosts the fan-out queue database; the feed data itself
    /// lives wherever `store` points.
    pub fn open(
        config: FeedConfig,
        store: Arc<dyn KeyValueStore>,
        data_dir: &Path,
    ) -> Result<Arc<Self>> {
        let events = FeedEvents::new(config.event_channel_capacity);
        let metrics = Arc::new(FeedMetrics::new());
        let users = UserDirectory::new(store.clone());
        let graph = Arc::new(FollowGraphManager::new(
            store.clone(),
            events.follow_sender(),
        ));
        let timelines = Arc::new(TimelineStore::new(
            store.clone(),
            config.max_timeline_length,
            metrics.clone(),
        ));
        let fanout = FanoutEngine::open(
            store.clone(),
            timelines.clone(),
            graph.clone(),
            data_dir.join("fanout_queue.sqlite3"),
            config.fanout(),
            metrics.clone(),
        )?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        fanout.start_worker(shutdown_rx);
        let registry = Arc::new(SubscriptionRegistry::new(
            store,
            events.clone(),
            metrics.clone(),
        ));
        Ok(Arc::new(Self {
            users,
            graph,
            timelines,
            fanout,
            registry,
            events,
            metrics,
            session: Mutex::new(None),
            shutdown,
        }))
    }

    // --- session -----------------------------------------------------------

    /// Starts a session for an authenticated user. Unknown users are created
    /// on first login; known users keep their stored attributes.
    pub async fn login(&self, profile: UserProfile) -> Result<UserProfile, StoreError> {
        let stored = self.users.ensure(&profile).await?;
        *self.session.lock().await = Some(stored.clone());
        self.events
            .publish_session(SessionEvent::LoggedIn(stored.clone()));
        info!("login: {}", stored.user_id);
        Ok(stored)
    }

    pub async fn logout(&self) {
        let previous = self.session.lock().await.take();
        if let Some(user) = previous {
            info!("logout: {}", user.user_id);
            self.events.publish_session(SessionEvent::LoggedOut);
        }
    }

    pub async fn logged_in_user(&self) -> Option<UserProfile> {
        self.session.lock().await.clone()
    }

    pub async fn user_is_logged_in_user(&self, user_id: &str) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|u| u.user_id == user_id)
            .unwrap_or(false)
    }

    // --- feeds -------------------------------------------------------------

    pub fn observe_latest_sparks(&self) -> Result<ObservedStream, SubscriptionError> {
        self.observe(StreamKey::LatestSparks)
    }

    pub async fn observe_logged_in_user_timeline(
        &self,
    ) -> Result<ObservedStream, SubscriptionError> {
        let Some(user) = self.logged_in_user().await else {
            return Err(SubscriptionError::NotLoggedIn);
        };
        self.observe(StreamKey::Timeline(user.user_id))
    }

    pub fn observe_sparks_for_user(
        &self,
        user_id: &str,
    ) -> Result<ObservedStream, SubscriptionError> {
        self.observe(StreamKey::Timeline(user_id.to_string()))
    }

    /// Ends one observation started by any `observe_*` call. Safe to call
    /// with a handle that was already returned.
    pub fn stop_observing(&self, handle: &SubscriptionHandle) {
        self.registry.unsubscribe(handle);
    }

    fn observe(&self, key: StreamKey) -> Result<ObservedStream, SubscriptionError> {
        let (handle, events) = self.registry.subscribe(key)?;
        Ok(ObservedStream { handle, events })
    }

    // --- posting -----------------------------------------------------------

    /// Posts a spark as the logged-in user. On `Ok`, the spark is in the
    /// author's timeline and the firehose; follower timelines are populated
    /// asynchronously by the fan-out worker.
    pub async fn post_spark(&self, text: &str) -> Result<Spark, PostError> {
        let Some(author) = self.logged_in_user().await else {
            return Err(PostError::NotLoggedIn);
        };
        self.fanout.post_spark(&author.user_id, text).await
    }

    // --- social graph ------------------------------------------------------

    pub fn observe_user_info(&self, user_id: &str) -> Result<ObservedStream, SubscriptionError> {
        self.observe(StreamKey::UserInfo(user_id.to_string()))
    }

    pub fn observe_followers_for_user(
        &self,
        user_id: &str,
    ) -> Result<ObservedStream, SubscriptionError> {
        self.observe(StreamKey::Followers(user_id.to_string()))
    }

    pub fn observe_followees_for_user(
        &self,
        user_id: &str,
    ) -> Result<ObservedStream, SubscriptionError> {
        self.observe(StreamKey::Followees(user_id.to_string()))
    }

    pub async fn start_following_user(&self, followee: &str) -> Result<bool, GraphError> {
        let Some(user) = self.logged_in_user().await else {
            return Err(GraphError::NotLoggedIn);
        };
        self.graph.follow(&user.user_id, followee).await
    }

    pub async fn stop_following_user(&self, followee: &str) -> Result<bool, GraphError> {
        let Some(user) = self.logged_in_user().await else {
            return Err(GraphError::NotLoggedIn);
        };
        self.graph.unfollow(&user.user_id, followee).await
    }

    // --- profile -----------------------------------------------------------

    pub async fn save_user(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.users.save(profile).await?;
        let mut session = self.session.lock().await;
        if session
            .as_ref()
            .map(|u| u.user_id == profile.user_id)
            .unwrap_or(false)
        {
            *session = Some(profile.clone());
        }
        Ok(())
    }

    // --- events ------------------------------------------------------------

    pub fn events(&self) -> &FeedEvents {
        &self.events
    }

    // --- components, for callers that need direct access -------------------

    pub fn follow_graph(&self) -> &FollowGraphManager {
        &self.graph
    }

    pub fn timelines(&self) -> &TimelineStore {
        &self.timelines
    }

    // --- lifecycle / diagnostics -------------------------------------------

    /// Tears down every live subscription and stops the fan-out worker.
    /// Infallible and safe to repeat; used at session end.
    pub fn cleanup(&self) {
        self.registry.teardown_all();
        let _ = self.shutdown.send(true);
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.fanout.stats().await.unwrap_or_default()
    }

    pub async fn log_diagnostics(&self) {
        let queue = self.queue_stats().await;
        info!(
            "diagnostics: {} queue: pending={} delivered={} dead={}",
            self.metrics.snapshot_json(),
            queue.pending,
            queue.delivered,
            queue.dead,
        );
    }

    pub fn log_listens(&self) {
        let active = self.registry.list_active();
        if active.is_empty() {
            info!("listens: none");
            return;
        }
        for (key, observers) in active {
            info!("listen {key}: observers={observers}");
        }
    }
}

impl Drop for Firefeed {
    fn drop(&mut self) {
        self.cleanup();
    }
}
