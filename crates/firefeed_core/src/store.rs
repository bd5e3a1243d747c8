/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Hierarchical key under which a single JSON document lives, e.g.
/// `sparks/<sparkId>` or `follows/followers/<followee>/<follower>`.
/// Segments are opaque and must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        debug_assert!(segments.iter().all(|s| !s.is_empty() && !s.contains('/')));
        Self { segments }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        let segment = segment.into();
        debug_assert!(!segment.is_empty() && !segment.contains('/'));
        segments.push(segment);
        Self { segments }
    }

    /// Last path segment: the child key under the parent prefix.
    pub fn key(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// True when `self` is exactly one level below `prefix`.
    pub fn is_direct_child_of(&self, prefix: &StorePath) -> bool {
        self.segments.len() == prefix.segments.len() + 1
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// One committed mutation. `value: None` means the path was removed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: StorePath,
    pub value: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("conflicting write")]
    Conflict,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Ordered, hierarchical key-value store with live change notifications.
/// The feed core only depends on this contract; the engine behind it is a
/// collaborator, not part of the core.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// Returns whether anything was actually removed.
    async fn remove(&self, path: &StorePath) -> Result<bool, StoreError>;

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;

    /// All-or-nothing multi-path write. `None` removes the path. Either every
    /// operation commits or none is observable; this is the primitive the
    /// dual-index follow graph relies on.
    async fn write_batch(&self, ops: Vec<(StorePath, Option<Value>)>) -> Result<(), StoreError>;

    /// Direct children of `prefix`, ordered by child key ascending.
    async fn list(&self, prefix: &StorePath) -> Result<Vec<(String, Value)>, StoreError>;

    /// Live stream of every committed mutation from this moment on. Events
    /// are published only after the corresponding write has committed.
    /// Callers filter by path; replay of existing state is layered on top by
    /// the subscription registry.
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// SQLite-backed store: one `kv(path, value)` table in WAL mode, change
/// events fanned out over a broadcast channel after commit.
pub struct SqliteStore {
    db_path: PathBuf,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>, change_capacity: usize) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open store db: {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS kv (
              path TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        let (changes, _) = broadcast::channel(change_capacity.max(16));
        Ok(Self { db_path, changes })
    }

    fn publish(&self, path: StorePath, value: Option<Value>) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.changes.send(ChangeEvent { path, value });
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        let key = path.to_string();
        let text = value.to_string();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<(), StoreError> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "INSERT OR REPLACE INTO kv(path, value) VALUES (?1, ?2)",
                    params![key, text],
                )?;
                Ok(())
            }
        })
        .await??;
        self.publish(path.clone(), Some(value));
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> Result<bool, StoreError> {
        let key = path.to_string();
        let removed = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<bool, StoreError> {
                let conn = Connection::open(db_path)?;
                let changed = conn.execute("DELETE FROM kv WHERE path=?1", params![key])?;
                Ok(changed > 0)
            }
        })
        .await??;
        if removed {
            self.publish(path.clone(), None);
        }
        Ok(removed)
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        let key = path.to_string();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Option<Value>, StoreError> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare("SELECT value FROM kv WHERE path=?1")?;
                let mut rows = stmt.query(params![key])?;
                match rows.next()? {
                    Some(row) => {
                        let text: String = row.get(0)?;
                        let value = serde_json::from_str(&text)
                            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                        Ok(Some(value))
                    }
                    None => Ok(None),
                }
            }
        })
        .await?
    }

    async fn write_batch(&self, ops: Vec<(StorePath, Option<Value>)>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, Option<String>)> = ops
            .iter()
            .map(|(p, v)| (p.to_string(), v.as_ref().map(Value::to_string)))
            .collect();
        let effective = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<bool>, StoreError> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                let mut effective = Vec::with_capacity(rows.len());
                for (key, text) in rows {
                    match text {
                        Some(text) => {
                            tx.execute(
                                "INSERT OR REPLACE INTO kv(path, value) VALUES (?1, ?2)",
                                params![key, text],
                            )?;
                            effective.push(true);
                        }
                        None => {
                            let changed =
                                tx.execute("DELETE FROM kv WHERE path=?1", params![key])?;
                            effective.push(changed > 0);
                        }
                    }
                }
                tx.commit()?;
                Ok(effective)
            }
        })
        .await??;
        for ((path, value), effective) in ops.into_iter().zip(effective) {
            if effective {
                self.publish(path, value);
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &StorePath) -> Result<Vec<(String, Value)>, StoreError> {
        let base = prefix.to_string();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<(String, Value)>, StoreError> {
                let conn = Connection::open(db_path)?;
                // `/` sorts directly below `0`, so a half-open range covers
                // every descendant without LIKE-escaping opaque ids.
                let lo = format!("{base}/");
                let hi = format!("{base}0");
                let mut stmt = conn.prepare(
                    "SELECT path, value FROM kv WHERE path > ?1 AND path < ?2 ORDER BY path ASC",
                )?;
                let mut rows = stmt.query(params![lo, hi])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let full: String = row.get(0)?;
                    let rest = &full[lo.len()..];
                    if rest.is_empty() || rest.contains('/') {
                        continue;
                    }
                    let text: String = row.get(1)?;
                    let value = serde_json::from_str(&text)
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                    out.push((rest.to_string(), value));
                }
                Ok(out)
            }
        })
        .await?
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
