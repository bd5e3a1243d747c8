/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::timeline::{Spark, TimelineId};
use crate::users::UserProfile;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Debug, Serialize)]
pub enum SessionEvent {
    LoggedIn(UserProfile),
    LoggedOut,
}

#[derive(Clone, Debug, Serialize)]
pub enum SparkEvent {
    Added { timeline: TimelineId, spark: Spark },
    Overflowed { timeline: TimelineId, spark: Spark },
}

#[derive(Clone, Debug, Serialize)]
pub enum FollowEvent {
    Started { follower: String, followee: String },
    Stopped { follower: String, followee: String },
}

#[derive(Clone, Debug, Serialize)]
pub enum UserEvent {
    Updated(UserProfile),
}

/// One broadcast channel per event category instead of a single delegate
/// callback carrying every event type. Publishing never blocks and never
/// fails; a channel with no subscribers simply drops the event.
#[derive(Clone)]
pub struct FeedEvents {
    session: broadcast::Sender<SessionEvent>,
    sparks: broadcast::Sender<SparkEvent>,
    follows: broadcast::Sender<FollowEvent>,
    users: broadcast::Sender<UserEvent>,
}

impl FeedEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        Self {
            session: broadcast::channel(capacity).0,
            sparks: broadcast::channel(capacity).0,
            follows: broadcast::channel(capacity).0,
            users: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn subscribe_sparks(&self) -> broadcast::Receiver<SparkEvent> {
        self.sparks.subscribe()
    }

    pub fn subscribe_follows(&self) -> broadcast::Receiver<FollowEvent> {
        self.follows.subscribe()
    }

    pub fn subscribe_users(&self) -> broadcast::Receiver<UserEvent> {
        self.users.subscribe()
    }

    /// The graph manager publishes follow events itself, on net changes only.
    pub(crate) fn follow_sender(&self) -> broadcast::Sender<FollowEvent> {
        self.follows.clone()
    }

    pub(crate) fn publish_session(&self, ev: SessionEvent) {
        let _ = self.session.send(ev);
    }

    pub(crate) fn publish_spark(&self, ev: SparkEvent) {
        let _ = self.sparks.send(ev);
    }

    pub(crate) fn publish_user(&self, ev: UserEvent) {
        let _ = self.users.send(ev);
    }
}
