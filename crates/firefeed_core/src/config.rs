/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::fanout::FanoutSettings;

/// Operational knobs for the feed core. The timeline bound and the fan-out
/// retry budget are deployment choices, not fixed protocol constants.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Upper bound on entries per timeline; the oldest entry is evicted once
    /// an append would exceed it.
    pub max_timeline_length: usize,
    pub fanout_max_attempts: u32,
    pub fanout_base_backoff_ms: u64,
    pub fanout_max_backoff_ms: u64,
    /// Jobs drained per fan-out worker pass.
    pub fanout_batch: u32,
    /// Buffer size of the typed domain event channels.
    pub event_channel_capacity: usize,
    /// Buffer size of the store-level change broadcast.
    pub store_change_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_timeline_length: 100,
            fanout_max_attempts: 10,
            fanout_base_backoff_ms: 250,
            fanout_max_backoff_ms: 60_000,
            fanout_batch: 64,
            event_channel_capacity: 256,
            store_change_capacity: 1024,
        }
    }
}

impl FeedConfig {
    pub fn fanout(&self) -> FanoutSettings {
        FanoutSettings {
            max_attempts: self.fanout_max_attempts.max(1),
            base_backoff_ms: self.fanout_base_backoff_ms.max(1),
            max_backoff_ms: self.fanout_max_backoff_ms.max(self.fanout_base_backoff_ms),
            batch: self.fanout_batch.max(1),
        }
    }
}
