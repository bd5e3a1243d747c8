/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use std::sync::atomic::{AtomicU64, Ordering};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Feed-wide counters. Constructed explicitly and passed to the components
/// that bump them, never ambient process state.
#[derive(Default)]
pub struct FeedMetrics {
    pub sparks_posted: AtomicU64,
    pub fanout_enqueued: AtomicU64,
    pub fanout_delivered: AtomicU64,
    pub fanout_retries: AtomicU64,
    pub fanout_dead: AtomicU64,
    pub timeline_evictions: AtomicU64,
    pub streams_opened: AtomicU64,
    pub streams_closed: AtomicU64,
    pub active_streams: AtomicU64,
    pub events_published: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spark_posted(&self) {
        self.sparks_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fanout_enqueued_add(&self, n: u64) {
        self.fanout_enqueued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fanout_delivered(&self) {
        self.fanout_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fanout_retry(&self) {
        self.fanout_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fanout_dead(&self) {
        self.fanout_dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeline_evicted(&self) {
        self.timeline_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn streams_reset(&self) {
        self.active_streams.store(0, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ts_ms": now_ms(),
            "posting": {
                "sparks_posted": self.sparks_posted.load(Ordering::Relaxed),
            },
            "fanout": {
                "enqueued": self.fanout_enqueued.load(Ordering::Relaxed),
                "delivered": self.fanout_delivered.load(Ordering::Relaxed),
                "retries": self.fanout_retries.load(Ordering::Relaxed),
                "dead": self.fanout_dead.load(Ordering::Relaxed),
            },
            "timelines": {
                "evictions": self.timeline_evictions.load(Ordering::Relaxed),
            },
            "streams": {
                "opened": self.streams_opened.load(Ordering::Relaxed),
                "closed": self.streams_closed.load(Ordering::Relaxed),
                "active": self.active_streams.load(Ordering::Relaxed),
                "events_published": self.events_published.load(Ordering::Relaxed),
            },
        })
    }
}
