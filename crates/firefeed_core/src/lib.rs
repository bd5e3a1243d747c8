/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

pub mod config;
pub mod diagnostics;
pub mod events;
pub mod facade;
pub mod fanout;
pub mod follow_graph;
pub mod push_id;
pub mod store;
pub mod subscriptions;
pub mod timeline;
pub mod users;

pub use config::FeedConfig;
pub use facade::{init_logging, Firefeed};
