/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::store::{KeyValueStore, StoreError, StorePath};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub photo_url: Option<String>,
    /// Identity provider the account came from, e.g. "facebook".
    #[serde(default)]
    pub provider: Option<String>,
}

pub fn user_path(user_id: &str) -> StorePath {
    StorePath::new(["users", user_id])
}

/// Profile records under `users/<userId>`. Users are never hard-deleted;
/// a profile stays present for as long as anything references it.
#[derive(Clone)]
pub struct UserDirectory {
    store: Arc<dyn KeyValueStore>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let value = serde_json::to_value(profile)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store.write(&user_path(&profile.user_id), value).await
    }

    pub async fn load(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let Some(value) = self.store.read(&user_path(user_id)).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Create-on-first-sight: persists `profile` if the user is unknown,
    /// otherwise returns the stored record untouched.
    pub async fn ensure(&self, profile: &UserProfile) -> Result<UserProfile, StoreError> {
        if let Some(existing) = self.load(&profile.user_id).await? {
            return Ok(existing);
        }
        self.save(profile).await?;
        Ok(profile.clone())
    }
}
