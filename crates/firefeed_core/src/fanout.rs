/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use crate::diagnostics::FeedMetrics;
use crate::follow_graph::FollowGraphManager;
use crate::push_id::PushIdGenerator;
use crate::store::{KeyValueStore, StoreError, StorePath};
use crate::timeline::{Spark, TimelineId, TimelineStore};
use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("spark text is empty")]
    EmptyText,
    #[error("no user is logged in")]
    NotLoggedIn,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct FanoutSettings {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub batch: u32,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff_ms: 250,
            max_backoff_ms: 60_000,
            batch: 64,
        }
    }
}

const STATUS_PENDING: i64 = 0;
const STATUS_DELIVERED: i64 = 1;
const STATUS_DEAD: i64 = 2;

/// Fan-out-on-write: a new spark is written to the author's canonical store,
/// the author's own timeline, and the firehose before `post_spark` returns;
/// delivery to each follower's timeline goes through a persistent job queue
/// drained by a background worker with bounded exponential backoff. A job
/// that exhausts its retry budget is parked as dead and that follower simply
/// misses the spark; posting itself never fails because of a follower.
pub struct FanoutEngine {
    store: Arc<dyn KeyValueStore>,
    timelines: Arc<TimelineStore>,
    graph: Arc<FollowGraphManager>,
    ids: PushIdGenerator,
    queue_db: PathBuf,
    notify: Arc<Notify>,
    settings: FanoutSettings,
    metrics: Arc<FeedMetrics>,
}

impl FanoutEngine {
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        timelines: Arc<TimelineStore>,
        graph: Arc<FollowGraphManager>,
        queue_db: impl AsRef<Path>,
        settings: FanoutSettings,
        metrics: Arc<FeedMetrics>,
    ) -> Result<Arc<Self>> {
        let queue_db = queue_db.as_ref().to_path_buf();
        init_queue_db(&queue_db)?;
        Ok(Arc::new(Self {
            store,
            timelines,
            graph,
            ids: PushIdGenerator::new(),
            queue_db,
            notify: Arc::new(Notify::new()),
            settings,
            metrics,
        }))
    }

    /// Creates and distributes a spark. On return the spark is durably in
    /// the author's timeline and the firehose; follower timelines catch up
    /// asynchronously. The follower set is snapshotted here: an unfollow
    /// racing the fan-out may still receive this one spark, and a follow
    /// racing it will not receive it retroactively.
    pub async fn post_spark(&self, author_id: &str, text: &str) -> Result<Spark, PostError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PostError::EmptyText);
        }

        let spark = Spark {
            spark_id: self.ids.generate(),
            author_id: author_id.to_string(),
            text: text.to_string(),
            created_at_ms: now_ms(),
        };
        let value = serde_json::to_value(&spark)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store
            .write(&StorePath::new(["sparks", &spark.spark_id]), value)
            .await?;
        self.timelines
            .append(&TimelineId::User(spark.author_id.clone()), &spark)
            .await?;
        self.timelines.append(&TimelineId::Latest, &spark).await?;
        self.metrics.spark_posted();

        let followers = self
            .graph
            .followers_of(author_id)
            .await
            .map_err(|e| match e {
                crate::follow_graph::GraphError::Store(s) => PostError::Store(s),
                other => PostError::Store(StoreError::Unavailable(other.to_string())),
            })?;
        if !followers.is_empty() {
            match self.enqueue(&spark, followers).await {
                Ok(pending) => {
                    debug!("spark {}: fan-out queued, {pending} jobs pending", spark.spark_id);
                    self.notify.notify_one();
                }
                // The post already succeeded for the author and the
                // firehose; a queue fault only delays followers.
                Err(e) => warn!("spark {}: fan-out enqueue failed: {e:#}", spark.spark_id),
            }
        }
        Ok(spark)
    }

    async fn enqueue(&self, spark: &Spark, targets: Vec<String>) -> Result<u64> {
        let created_at = now_ms();
        let spark_json = serde_json::to_string(spark)?;
        let count = targets.len() as u64;
        let pending = tokio::task::spawn_blocking({
            let queue_db = self.queue_db.clone();
            move || -> Result<u64> {
                let mut conn = Connection::open(queue_db)?;
                let tx = conn.transaction()?;
                for target in targets {
                    tx.execute(
                        r#"
                        INSERT INTO fanout_jobs (
                          id, created_at_ms, next_attempt_at_ms, attempt, status, target_user, spark_json, last_error
                        ) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, NULL)
                        "#,
                        params![new_job_id(), created_at, created_at, STATUS_PENDING, target, spark_json],
                    )?;
                }
                tx.commit()?;
                let pending: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM fanout_jobs WHERE status = ?1",
                    params![STATUS_PENDING],
                    |r| r.get(0),
                )?;
                Ok(pending)
            }
        })
        .await??;
        self.metrics.fanout_enqueued_add(count);
        Ok(pending)
    }

    pub fn start_worker(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_loop(shutdown).await {
                warn!("fan-out worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("fan-out queue db: {}", self.queue_db.display());
        let tick = Duration::from_millis(500);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let jobs = self.fetch_due_jobs(self.settings.batch).await?;
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            for job in jobs {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.process_one(job).await {
                    warn!("fan-out job error: {e:#}");
                }
            }
        }
        Ok(())
    }

    async fn process_one(&self, job: Job) -> Result<()> {
        let spark: Spark =
            serde_json::from_str(&job.spark_json).context("corrupt fan-out job payload")?;
        let attempt_no = job.attempt.saturating_add(1);
        let timeline = TimelineId::User(job.target_user.clone());
        match self.timelines.append(&timeline, &spark).await {
            Ok(outcome) => {
                self.mark_delivered(&job.id).await?;
                self.metrics.fanout_delivered();
                if let Some(evicted) = outcome.evicted {
                    debug!(
                        "timeline {timeline}: {} overflowed while landing {}",
                        evicted.spark_id, spark.spark_id
                    );
                }
            }
            Err(e) => {
                if attempt_no >= self.settings.max_attempts {
                    self.mark_dead(&job.id, &e.to_string()).await?;
                    self.metrics.fanout_dead();
                    warn!(
                        "spark {} will not reach {}: retries exhausted ({e})",
                        spark.spark_id, job.target_user
                    );
                } else {
                    let delay = next_backoff(
                        attempt_no,
                        self.settings.base_backoff_ms,
                        self.settings.max_backoff_ms,
                    );
                    self.reschedule(&job.id, attempt_no, delay, &e.to_string())
                        .await?;
                    self.metrics.fanout_retry();
                }
            }
        }
        Ok(())
    }

    async fn fetch_due_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        tokio::task::spawn_blocking({
            let queue_db = self.queue_db.clone();
            move || -> Result<Vec<Job>> {
                let conn = Connection::open(queue_db)?;
                let now = now_ms();
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, attempt, target_user, spark_json
                    FROM fanout_jobs
                    WHERE status = ?1 AND next_attempt_at_ms <= ?2
                    ORDER BY next_attempt_at_ms ASC
                    LIMIT ?3
                    "#,
                )?;
                let mut rows = stmt.query(params![STATUS_PENDING, now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(Job {
                        id: row.get(0)?,
                        attempt: row.get(1)?,
                        target_user: row.get(2)?,
                        spark_json: row.get(3)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        self.update_job(id, move |conn, id| {
            conn.execute(
                "UPDATE fanout_jobs SET status = ?2, last_error = NULL WHERE id = ?1",
                params![id, STATUS_DELIVERED],
            )
        })
        .await
    }

    async fn mark_dead(&self, id: &str, err: &str) -> Result<()> {
        let err = err.to_string();
        self.update_job(id, move |conn, id| {
            conn.execute(
                "UPDATE fanout_jobs SET status = ?2, last_error = ?3 WHERE id = ?1",
                params![id, STATUS_DEAD, err],
            )
        })
        .await
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        let err = err.to_string();
        self.update_job(id, move |conn, id| {
            conn.execute(
                "UPDATE fanout_jobs SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE id = ?1",
                params![id, attempt, next, err],
            )
        })
        .await
    }

    async fn update_job<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&Connection, &str) -> rusqlite::Result<usize> + Send + 'static,
    {
        tokio::task::spawn_blocking({
            let queue_db = self.queue_db.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = Connection::open(queue_db)?;
                apply(&conn, &id)?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let queue_db = self.queue_db.clone();
            move || -> Result<QueueStats> {
                let conn = Connection::open(queue_db)?;
                let count = |status: i64| -> Result<u64> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM fanout_jobs WHERE status = ?1",
                        params![status],
                        |r| r.get(0),
                    )?)
                };
                Ok(QueueStats {
                    pending: count(STATUS_PENDING)?,
                    delivered: count(STATUS_DELIVERED)?,
                    dead: count(STATUS_DEAD)?,
                })
            }
        })
        .await?
    }
}

#[derive(Debug, Clone)]
struct Job {
    id: String,
    attempt: u32,
    target_user: String,
    spark_json: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub delivered: u64,
    pub dead: u64,
}

fn init_queue_db(path: &Path) -> Result<()> {
    let conn =
        Connection::open(path).with_context(|| format!("open queue db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS fanout_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          target_user TEXT NOT NULL,
          spark_json TEXT NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fanout_due ON fanout_jobs(status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_job_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

fn next_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut ms = base_ms.saturating_mul(1u64 << pow);
    if ms > max_ms {
        ms = max_ms;
    }
    // jitter 0..100ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter = u16::from_le_bytes(b) as u64 % 100;
    Duration::from_millis(ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeEvent, SqliteStore};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::sync::broadcast;

    /// Store wrapper that fails the first N writes under a given prefix,
    /// then recovers. Used to drive the fan-out retry path.
    struct FlakyStore {
        inner: SqliteStore,
        fail_prefix: Mutex<String>,
        failures_left: AtomicU32,
    }

    impl FlakyStore {
        fn fail_writes_under(&self, prefix: &str, n: u32) {
            *self.fail_prefix.lock().unwrap() = prefix.to_string();
            self.failures_left.store(n, Ordering::SeqCst);
        }

        fn should_fail(&self, path: &StorePath) -> bool {
            let prefix = self.fail_prefix.lock().unwrap();
            if prefix.is_empty() || !path.to_string().starts_with(prefix.as_str()) {
                return false;
            }
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
            if self.should_fail(path) {
                return Err(StoreError::Unavailable("injected fault".into()));
            }
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
            self.inner.watch()
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        timelines: Arc<TimelineStore>,
        graph: Arc<FollowGraphManager>,
        engine: Arc<FanoutEngine>,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(dir: &tempfile::TempDir, settings: FanoutSettings) -> Fixture {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::open(dir.path().join("kv.sqlite3"), 1024).unwrap(),
            fail_prefix: Mutex::new(String::new()),
            failures_left: AtomicU32::new(0),
        });
        let metrics = Arc::new(FeedMetrics::new());
        let timelines = Arc::new(TimelineStore::new(store.clone(), 100, metrics.clone()));
        let graph = Arc::new(FollowGraphManager::new(
            store.clone(),
            broadcast::channel(64).0,
        ));
        let engine = FanoutEngine::open(
            store.clone(),
            timelines.clone(),
            graph.clone(),
            dir.path().join("fanout.sqlite3"),
            settings,
            metrics,
        )
        .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        engine.start_worker(shutdown_rx);
        Fixture {
            store,
            timelines,
            graph,
            engine,
            _shutdown: shutdown_tx,
        }
    }

    fn fast_settings() -> FanoutSettings {
        FanoutSettings {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 50,
            batch: 16,
        }
    }

    async fn wait_for_timeline(f: &Fixture, user: &str, want: usize) {
        let timeline = TimelineId::User(user.to_string());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if f.timelines.len(&timeline).await.unwrap() >= want {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timeline {timeline} never reached {want} entries"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        assert!(matches!(
            f.engine.post_spark("u1", "   ").await,
            Err(PostError::EmptyText)
        ));
        assert_eq!(f.timelines.len(&TimelineId::Latest).await.unwrap(), 0);
        assert_eq!(
            f.timelines.len(&TimelineId::User("u1".into())).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn post_lands_in_author_timeline_and_firehose_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        let spark = f.engine.post_spark("u1", "hello world").await.unwrap();
        assert_eq!(spark.author_id, "u1");
        assert_eq!(spark.text, "hello world");

        assert_eq!(f.timelines.len(&TimelineId::Latest).await.unwrap(), 1);
        let own = f
            .timelines
            .snapshot(&TimelineId::User("u1".into()))
            .await
            .unwrap();
        assert_eq!(own[0].spark_id, spark.spark_id);
        // Canonical copy exists too.
        assert!(f
            .store
            .read(&StorePath::new(["sparks", &spark.spark_id]))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn fan_out_reaches_every_follower() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        f.graph.follow("f1", "author").await.unwrap();
        f.graph.follow("f2", "author").await.unwrap();

        f.engine.post_spark("author", "to my fans").await.unwrap();
        wait_for_timeline(&f, "f1", 1).await;
        wait_for_timeline(&f, "f2", 1).await;

        let stats = f.engine.stats().await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dead, 0);
    }

    #[tokio::test]
    async fn transient_follower_failure_is_retried_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        f.graph.follow("f1", "author").await.unwrap();
        f.graph.follow("f2", "author").await.unwrap();
        f.store.fail_writes_under("timelines/user:f1", 2);

        let spark = f.engine.post_spark("author", "eventually there").await.unwrap();
        wait_for_timeline(&f, "f1", 1).await;
        wait_for_timeline(&f, "f2", 1).await;

        let f1 = f.timelines.snapshot(&TimelineId::User("f1".into())).await.unwrap();
        assert_eq!(f1[0].spark_id, spark.spark_id);
        let stats = f.engine.stats().await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dead, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_job_without_failing_the_post() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        f.graph.follow("f1", "author").await.unwrap();
        // More faults than the retry budget.
        f.store.fail_writes_under("timelines/user:f1", 100);

        f.engine.post_spark("author", "never arrives").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = f.engine.stats().await.unwrap();
            if stats.dead == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "job never went dead");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            f.timelines.len(&TimelineId::User("f1".into())).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn author_without_followers_enqueues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        f.engine.post_spark("loner", "anybody?").await.unwrap();
        let stats = f.engine.stats().await.unwrap();
        assert_eq!(stats.pending + stats.delivered + stats.dead, 0);
    }

    #[tokio::test]
    async fn spark_ids_order_posts_across_authors() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(&dir, fast_settings());
        let a = f.engine.post_spark("u1", "first").await.unwrap();
        let b = f.engine.post_spark("u2", "second").await.unwrap();
        let c = f.engine.post_spark("u1", "third").await.unwrap();
        assert!(a.spark_id < b.spark_id);
        assert!(b.spark_id < c.spark_id);

        let firehose = f.timelines.snapshot(&TimelineId::Latest).await.unwrap();
        let texts: Vec<_> = firehose.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["third", "second", "first"]);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let a = next_backoff(1, 100, 10_000);
        let b = next_backoff(5, 100, 10_000);
        let cap = next_backoff(30, 100, 10_000);
        assert!(a >= Duration::from_millis(100));
        assert!(b >= Duration::from_millis(1600));
        assert!(cap < Duration::from_millis(10_200));
    }
}
