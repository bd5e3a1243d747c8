/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::events::FollowEvent;
use crate::store::{KeyValueStore, StoreError, StorePath};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("a user cannot follow themselves")]
    SelfFollow,
    #[error("no user is logged in")]
    NotLoggedIn,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn followers_path(followee: &str) -> StorePath {
    StorePath::new(["follows", "followers", followee])
}

pub fn followees_path(follower: &str) -> StorePath {
    StorePath::new(["follows", "followees", follower])
}

/// The follow relation, denormalized into two indices that must always
/// agree: `follows/followers/<followee>/<follower>` and
/// `follows/followees/<follower>/<followee>`. Both sides of an edge are
/// written in one store transaction; concurrent calls on the same pair are
/// serialized by a per-edge lock.
pub struct FollowGraphManager {
    store: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<FollowEvent>,
    edge_locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl FollowGraphManager {
    pub fn new(store: Arc<dyn KeyValueStore>, events: broadcast::Sender<FollowEvent>) -> Self {
        Self {
            store,
            events,
            edge_locks: Mutex::new(HashMap::new()),
        }
    }

    fn edge_lock(&self, follower: &str, followee: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.edge_locks.lock().expect("edge lock map poisoned");
        locks
            .entry((follower.to_string(), followee.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Creates the edge. Returns `Ok(true)` on a net change, `Ok(false)` when
    /// the edge already existed (idempotent, no event).
    pub async fn follow(&self, follower: &str, followee: &str) -> Result<bool, GraphError> {
        if follower == followee {
            return Err(GraphError::SelfFollow);
        }
        let lock = self.edge_lock(follower, followee);
        let _guard = lock.lock().await;

        let edge = followees_path(follower).child(followee);
        if self.store.read(&edge).await?.is_some() {
            return Ok(false);
        }
        let entry = json!({ "since_ms": now_ms() });
        self.store
            .write_batch(vec![
                (followers_path(followee).child(follower), Some(entry.clone())),
                (edge, Some(entry)),
            ])
            .await?;
        debug!("follow {follower} -> {followee}");
        let _ = self.events.send(FollowEvent::Started {
            follower: follower.to_string(),
            followee: followee.to_string(),
        });
        Ok(true)
    }

    /// Removes the edge. Returns `Ok(true)` on a net change; a missing edge
    /// is a no-op with no event.
    pub async fn unfollow(&self, follower: &str, followee: &str) -> Result<bool, GraphError> {
        if follower == followee {
            return Ok(false);
        }
        let lock = self.edge_lock(follower, followee);
        let _guard = lock.lock().await;

        let edge = followees_path(follower).child(followee);
        if self.store.read(&edge).await?.is_none() {
            return Ok(false);
        }
        self.store
            .write_batch(vec![
                (followers_path(followee).child(follower), None),
                (edge, None),
            ])
            .await?;
        debug!("unfollow {follower} -> {followee}");
        let _ = self.events.send(FollowEvent::Stopped {
            follower: follower.to_string(),
            followee: followee.to_string(),
        });
        Ok(true)
    }

    pub async fn is_following(&self, follower: &str, followee: &str) -> Result<bool, GraphError> {
        let edge = followees_path(follower).child(followee);
        Ok(self.store.read(&edge).await?.is_some())
    }

    /// Everyone following `user_id`, ordered by follower id. This is the
    /// fan-out set (minus the author) for a new spark.
    pub async fn followers_of(&self, user_id: &str) -> Result<Vec<String>, GraphError> {
        let entries = self.store.list(&followers_path(user_id)).await?;
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn followees_of(&self, user_id: &str) -> Result<Vec<String>, GraphError> {
        let entries = self.store.list(&followees_path(user_id)).await?;
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
