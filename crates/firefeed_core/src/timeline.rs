/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::diagnostics::FeedMetrics;
use crate::store::{ChangeEvent, KeyValueStore, StoreError, StorePath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// An immutable user-authored post. The spark id doubles as the timeline
/// sort key: ids are monotonic push ids, so byte order is creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spark {
    pub spark_id: String,
    pub author_id: String,
    pub text: String,
    pub created_at_ms: i64,
}

/// Either the global firehose every spark lands in, or one user's personal
/// timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimelineId {
    Latest,
    User(String),
}

impl TimelineId {
    fn storage_key(&self) -> String {
        match self {
            TimelineId::Latest => "latest".to_string(),
            TimelineId::User(id) => format!("user:{id}"),
        }
    }

    pub fn path(&self) -> StorePath {
        StorePath::new(["timelines".to_string(), self.storage_key()])
    }

    pub(crate) fn from_storage_key(key: &str) -> Option<TimelineId> {
        if key == "latest" {
            Some(TimelineId::Latest)
        } else {
            key.strip_prefix("user:")
                .map(|id| TimelineId::User(id.to_string()))
        }
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEvent {
    Added(Spark),
    Removed(String),
}

/// Result of a settled append: the entry that fell off the bounded window,
/// if the append pushed one out. The caller turns it into an overflow
/// notification.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    pub evicted: Option<Spark>,
}

/// Snapshot plus live deltas for one timeline. `current` is ordered newest
/// first; `changes` carries raw store mutations which `event_for` narrows to
/// this timeline.
pub struct TimelineWatch {
    pub current: Vec<Spark>,
    pub changes: broadcast::Receiver<ChangeEvent>,
    prefix: StorePath,
}

impl TimelineWatch {
    /// Translates a raw store event into a timeline event, or `None` when it
    /// belongs to some other path.
    pub fn event_for(&self, ev: &ChangeEvent) -> Option<TimelineEvent> {
        if !ev.path.is_direct_child_of(&self.prefix) {
            return None;
        }
        match &ev.value {
            Some(v) => serde_json::from_value(v.clone()).ok().map(TimelineEvent::Added),
            None => Some(TimelineEvent::Removed(ev.path.key().to_string())),
        }
    }
}

/// Bounded per-timeline windows over the store. Entries are denormalized
/// copies of the spark document keyed by spark id; the window bound is
/// enforced on every append by evicting the oldest sort key.
pub struct TimelineStore {
    store: Arc<dyn KeyValueStore>,
    max_len: usize,
    metrics: Arc<FeedMetrics>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TimelineStore {
    pub fn new(store: Arc<dyn KeyValueStore>, max_len: usize, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            store,
            max_len: max_len.max(1),
            metrics,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn timeline_lock(&self, timeline: &TimelineId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("timeline lock map poisoned");
        locks
            .entry(timeline.storage_key())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Inserts `spark` at the position its sort key dictates and restores the
    /// window bound. Accepts entries older than the current head (replay and
    /// backfill are valid); an entry older than the whole full window is
    /// evicted right back out, which keeps the bound an invariant rather than
    /// a happy-path property.
    pub async fn append(
        &self,
        timeline: &TimelineId,
        spark: &Spark,
    ) -> Result<AppendOutcome, StoreError> {
        let lock = self.timeline_lock(timeline);
        let _guard = lock.lock().await;

        let prefix = timeline.path();
        let value = serde_json::to_value(spark)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store.write(&prefix.child(&spark.spark_id), value).await?;

        let mut entries = self.store.list(&prefix).await?;
        let mut outcome = AppendOutcome::default();
        while entries.len() > self.max_len {
            // list() is ordered ascending, so the first entry is the oldest.
            let (key, value) = entries.remove(0);
            self.store.remove(&prefix.child(&key)).await?;
            self.metrics.timeline_evicted();
            debug!("timeline {timeline}: evicted {key}");
            outcome.evicted = serde_json::from_value(value).ok();
        }
        Ok(outcome)
    }

    /// Removes one entry, e.g. when an author deletes a spark. No-op if the
    /// entry is absent.
    pub async fn remove(&self, timeline: &TimelineId, spark_id: &str) -> Result<bool, StoreError> {
        let lock = self.timeline_lock(timeline);
        let _guard = lock.lock().await;
        self.store.remove(&timeline.path().child(spark_id)).await
    }

    pub async fn len(&self, timeline: &TimelineId) -> Result<usize, StoreError> {
        Ok(self.store.list(&timeline.path()).await?.len())
    }

    /// Current contents ordered newest first.
    pub async fn snapshot(&self, timeline: &TimelineId) -> Result<Vec<Spark>, StoreError> {
        let entries = self.store.list(&timeline.path()).await?;
        let mut sparks: Vec<Spark> = entries
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect();
        sparks.reverse();
        Ok(sparks)
    }

    /// Live view: existing contents first, then every later mutation. The
    /// subscription registry builds its replay-then-stream contract on the
    /// same primitives.
    pub async fn observe(&self, timeline: &TimelineId) -> Result<TimelineWatch, StoreError> {
        // Subscribe before snapshotting so nothing between the two is lost;
        // a delta that races the snapshot shows up as a duplicate `Added`,
        // which positional insertion by sort key absorbs.
        let changes = self.store.watch();
        let current = self.snapshot(timeline).await?;
        Ok(TimelineWatch {
            current,
            changes,
            prefix: timeline.path(),
        })
    }
}
