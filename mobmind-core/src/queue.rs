//! Request queue shared with the game server.
//!
//! The game server inserts rows into `ai_requests` and reads decisions from
//! `ai_responses`. Requests move `pending -> processing -> completed`
//! (or `failed` when a row cannot be decoded).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{ActionType, InferenceRequest, InferenceResponse};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ai_requests (
    request_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    monster_id   INTEGER NOT NULL,
    archetype    TEXT NOT NULL,
    state_vector TEXT NOT NULL,
    map_id       INTEGER NOT NULL DEFAULT 0,
    position_x   INTEGER NOT NULL DEFAULT 0,
    position_y   INTEGER NOT NULL DEFAULT 0,
    hp_ratio     REAL NOT NULL DEFAULT 1.0,
    sp_ratio     REAL NOT NULL DEFAULT 1.0,
    priority     INTEGER NOT NULL DEFAULT 0,
    status       TEXT NOT NULL DEFAULT 'pending',
    created_at   TEXT NOT NULL,
    processed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_ai_requests_pending
    ON ai_requests(status, priority DESC, created_at);

CREATE TABLE IF NOT EXISTS ai_responses (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id           INTEGER NOT NULL,
    monster_id           INTEGER NOT NULL,
    action_type          TEXT NOT NULL,
    action_id            INTEGER NOT NULL,
    action_params        TEXT NOT NULL,
    model_outputs        TEXT NOT NULL,
    fusion_weights       TEXT NOT NULL,
    confidence           REAL NOT NULL,
    coordination_action  TEXT,
    coordination_bonus   REAL,
    pack_id              INTEGER,
    pack_size            INTEGER,
    inference_latency_ms REAL NOT NULL,
    cache_used           INTEGER NOT NULL,
    fallback_level       INTEGER NOT NULL,
    created_at           TEXT NOT NULL,
    read_at              TEXT
);
CREATE INDEX IF NOT EXISTS idx_ai_responses_request ON ai_responses(request_id);
"#;

/// Lifecycle of a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

/// Source of request batches and sink for responses.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Claim up to `max_batch` pending requests, highest priority first
    async fn poll_requests(&self, max_batch: usize) -> Result<Vec<InferenceRequest>>;

    /// Persist a batch of responses and complete their requests
    async fn write_responses(&self, responses: &[InferenceResponse]) -> Result<()>;

    /// Delete finished requests older than `retention_hours`
    async fn cleanup_old_requests(&self, retention_hours: u32) -> Result<usize>;

    /// Delete read responses older than `retention_hours`
    async fn cleanup_old_responses(&self, retention_hours: u32) -> Result<usize>;

    /// Return claimed requests to `pending` so a later poll picks them up
    async fn release_requests(&self, request_ids: &[i64]) -> Result<usize>;

    /// Return requests claimed longer than `older_than` ago to `pending`
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize>;

    /// How long to sleep when a poll comes back empty
    fn poll_interval(&self) -> Duration;

    async fn close(&self) {}
}

pub(crate) fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

pub(crate) fn cutoff(retention_hours: u32) -> String {
    timestamp(Utc::now() - ChronoDuration::hours(i64::from(retention_hours)))
}

/// Open a database shared with the game server: WAL mode, short busy wait
pub(crate) fn open_shared(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(500))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

fn json_map(raw: &str) -> serde_json::Map<String, serde_json::Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// SQLite-backed queue.
///
/// Thread-safe via internal Mutex, like the rest of the database access.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    poll_interval: Duration,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`
    pub fn open(path: &Path, poll_interval: Duration) -> Result<Self> {
        Self::init(open_shared(path)?, poll_interval)
    }

    /// In-memory queue
    pub fn open_in_memory(poll_interval: Duration) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, poll_interval)
    }

    fn init(conn: Connection, poll_interval: Duration) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            poll_interval,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        self.conn()?.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Insert a pending request; `request.request_id` is ignored and the
    /// assigned id is returned
    pub fn enqueue(&self, request: &InferenceRequest) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ai_requests (monster_id, archetype, state_vector, map_id, position_x,
                                      position_y, hp_ratio, sp_ratio, priority, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
            params![
                request.monster_id,
                request.archetype,
                serde_json::to_string(&request.state_vector)?,
                request.map_id,
                request.position_x,
                request.position_y,
                request.hp_ratio,
                request.sp_ratio,
                request.priority,
                now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Number of requests waiting to be claimed
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ai_requests WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Current status of a request
    pub fn request_status(&self, request_id: i64) -> Result<Option<RequestStatus>> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM ai_requests WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(RequestStatus::parse))
    }

    /// Read the newest unread response for a request and mark it read
    pub fn take_response(&self, request_id: i64) -> Result<Option<InferenceResponse>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, request_id, monster_id, action_type, action_id, action_params,
                        model_outputs, fusion_weights, confidence, coordination_action,
                        coordination_bonus, pack_id, pack_size, inference_latency_ms,
                        cache_used, fallback_level
                 FROM ai_responses
                 WHERE request_id = ?1 AND read_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                params![request_id],
                |row| {
                    let action_type: String = row.get(3)?;
                    let action_params: String = row.get(5)?;
                    let model_outputs: String = row.get(6)?;
                    let fusion_weights: String = row.get(7)?;
                    let pack_size: Option<i64> = row.get(12)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        InferenceResponse {
                            request_id: row.get(1)?,
                            monster_id: row.get(2)?,
                            action_type: ActionType::parse(&action_type)
                                .unwrap_or(ActionType::ErrorFallback),
                            action_id: row.get(4)?,
                            action_params: json_map(&action_params),
                            model_outputs: json_map(&model_outputs),
                            fusion_weights: json_map(&fusion_weights),
                            confidence: row.get(8)?,
                            coordination_action: row.get(9)?,
                            coordination_bonus: row.get(10)?,
                            pack_id: row.get(11)?,
                            pack_size: pack_size.map(|s| s as usize),
                            inference_latency_ms: Some(row.get(13)?),
                            cache_used: row.get(14)?,
                            fallback_level: row.get(15)?,
                        },
                    ))
                },
            )
            .optional()?;

        let Some((id, response)) = row else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE ai_responses SET read_at = ?1 WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(Some(response))
    }
}

type RequestRow = (i64, i64, String, String, i32, i32, i32, f32, f32, i32);

#[async_trait]
impl RequestProcessor for SqliteQueue {
    async fn poll_requests(&self, max_batch: usize) -> Result<Vec<InferenceRequest>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<RequestRow> = {
            let mut stmt = tx.prepare(
                "SELECT request_id, monster_id, archetype, state_vector, map_id,
                        position_x, position_y, hp_ratio, sp_ratio, priority
                 FROM ai_requests
                 WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, request_id ASC
                 LIMIT ?1",
            )?;
            stmt.query_map(params![max_batch as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let processed_at = now();
        let mut requests = Vec::with_capacity(rows.len());
        for (request_id, monster_id, archetype, state, map_id, x, y, hp, sp, priority) in rows {
            let state_vector: Vec<f32> = match serde_json::from_str(&state) {
                Ok(v) => v,
                Err(e) => {
                    warn!(request_id, error = %e, "Malformed state vector, failing request");
                    tx.execute(
                        "UPDATE ai_requests SET status = 'failed', processed_at = ?1 WHERE request_id = ?2",
                        params![processed_at, request_id],
                    )?;
                    continue;
                }
            };

            tx.execute(
                "UPDATE ai_requests SET status = 'processing', processed_at = ?1 WHERE request_id = ?2",
                params![processed_at, request_id],
            )?;
            requests.push(InferenceRequest {
                request_id,
                monster_id,
                state_vector,
                archetype,
                position_x: x,
                position_y: y,
                map_id,
                hp_ratio: hp,
                sp_ratio: sp,
                priority,
            });
        }

        tx.commit()?;
        if !requests.is_empty() {
            debug!(count = requests.len(), "Claimed pending requests");
        }
        Ok(requests)
    }

    async fn write_responses(&self, responses: &[InferenceResponse]) -> Result<()> {
        if responses.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at = now();
        {
            let mut insert = tx.prepare(
                "INSERT INTO ai_responses (request_id, monster_id, action_type, action_id,
                        action_params, model_outputs, fusion_weights, confidence,
                        coordination_action, coordination_bonus, pack_id, pack_size,
                        inference_latency_ms, cache_used, fallback_level, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            let mut complete =
                tx.prepare("UPDATE ai_requests SET status = 'completed' WHERE request_id = ?1")?;

            for r in responses {
                insert.execute(params![
                    r.request_id,
                    r.monster_id,
                    r.action_type.as_str(),
                    r.action_id,
                    serde_json::to_string(&r.action_params)?,
                    serde_json::to_string(&r.model_outputs)?,
                    serde_json::to_string(&r.fusion_weights)?,
                    r.confidence,
                    r.coordination_action,
                    r.coordination_bonus,
                    r.pack_id,
                    r.pack_size.map(|s| s as i64),
                    r.latency_ms(),
                    r.cache_used,
                    r.fallback_level,
                    created_at,
                ])?;
                complete.execute(params![r.request_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn cleanup_old_requests(&self, retention_hours: u32) -> Result<usize> {
        let deleted = self.conn()?.execute(
            "DELETE FROM ai_requests
             WHERE status IN ('completed', 'failed') AND created_at < ?1",
            params![cutoff(retention_hours)],
        )?;
        if deleted > 0 {
            info!(deleted, "Cleaned up old requests");
        }
        Ok(deleted)
    }

    async fn cleanup_old_responses(&self, retention_hours: u32) -> Result<usize> {
        let deleted = self.conn()?.execute(
            "DELETE FROM ai_responses WHERE read_at IS NOT NULL AND created_at < ?1",
            params![cutoff(retention_hours)],
        )?;
        if deleted > 0 {
            info!(deleted, "Cleaned up old responses");
        }
        Ok(deleted)
    }

    async fn release_requests(&self, request_ids: &[i64]) -> Result<usize> {
        if request_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut released = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE ai_requests SET status = 'pending', processed_at = NULL
                 WHERE request_id = ?1 AND status = 'processing'",
            )?;
            for id in request_ids {
                released += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        if released > 0 {
            warn!(released, "Released claimed requests back to pending");
        }
        Ok(released)
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let age = ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::MAX);
        let stale_before = Utc::now()
            .checked_sub_signed(age)
            .map(timestamp)
            .unwrap_or_default();
        let reclaimed = self.conn()?.execute(
            "UPDATE ai_requests SET status = 'pending', processed_at = NULL
             WHERE status = 'processing' AND processed_at < ?1",
            params![stale_before],
        )?;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale request claims");
        }
        Ok(reclaimed)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn close(&self) {
        if let Ok(conn) = self.conn() {
            if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
                warn!(error = %e, "Failed to optimize queue database on close");
            }
        }
        info!("Request queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue() -> SqliteQueue {
        SqliteQueue::open_in_memory(Duration::from_millis(10)).unwrap()
    }

    fn request(monster_id: i64, priority: i32) -> InferenceRequest {
        InferenceRequest {
            request_id: 0,
            monster_id,
            state_vector: vec![0.25, 0.5],
            archetype: "aggressive".to_string(),
            position_x: 3,
            position_y: 4,
            map_id: 7,
            hp_ratio: 0.9,
            sp_ratio: 0.4,
            priority,
        }
    }

    fn backdate(queue: &SqliteQueue, table: &str, hours: i64) {
        let old = timestamp(Utc::now() - ChronoDuration::hours(hours));
        queue
            .conn()
            .unwrap()
            .execute(&format!("UPDATE {table} SET created_at = ?1"), params![old])
            .unwrap();
    }

    #[test]
    fn test_request_status_strings() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("timeout"), None);
    }

    #[tokio::test]
    async fn test_poll_orders_by_priority_and_claims() {
        let queue = queue();
        let low = queue.enqueue(&request(1, 0)).unwrap();
        let high = queue.enqueue(&request(2, 9)).unwrap();
        queue.enqueue(&request(3, 0)).unwrap();

        let batch = queue.poll_requests(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].request_id, high);
        assert_eq!(batch[1].request_id, low);
        assert_eq!(batch[0].state_vector, vec![0.25, 0.5]);
        assert_eq!(batch[0].position(), (3, 4));
        assert_eq!(batch[0].sp_ratio, 0.4);

        assert_eq!(queue.request_status(high).unwrap(), Some(RequestStatus::Processing));
        assert_eq!(queue.pending_count().unwrap(), 1);

        // Claimed rows are not handed out twice
        let rest = queue.poll_requests(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(queue.poll_requests(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_responses_completes_requests() {
        let queue = queue();
        queue.enqueue(&request(5, 0)).unwrap();
        let batch = queue.poll_requests(1).await.unwrap();
        let req = &batch[0];

        let mut response = InferenceResponse::for_request(req, ActionType::Coordinated, 4, 0.9, 1)
            .with_latency(3.5)
            .with_output("threat_count", 2);
        response.pack_id = Some(5);
        response.pack_size = Some(3);
        response.coordination_action = Some("retreat_call".to_string());

        queue.write_responses(&[response.clone()]).await.unwrap();
        assert_eq!(
            queue.request_status(req.request_id).unwrap(),
            Some(RequestStatus::Completed)
        );

        let stored = queue.take_response(req.request_id).unwrap().unwrap();
        assert_eq!(stored, response);
        assert!(queue.take_response(req.request_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_row_is_failed_not_returned() {
        let queue = queue();
        let good = queue.enqueue(&request(1, 0)).unwrap();
        let bad = queue.enqueue(&request(2, 0)).unwrap();
        queue
            .conn()
            .unwrap()
            .execute(
                "UPDATE ai_requests SET state_vector = 'nope' WHERE request_id = ?1",
                params![bad],
            )
            .unwrap();

        let batch = queue.poll_requests(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].request_id, good);
        assert_eq!(queue.request_status(bad).unwrap(), Some(RequestStatus::Failed));
    }

    #[tokio::test]
    async fn test_cleanup_respects_status_and_age() {
        let queue = queue();
        queue.enqueue(&request(1, 0)).unwrap();
        queue.enqueue(&request(2, 0)).unwrap();
        let batch = queue.poll_requests(1).await.unwrap();
        let response = InferenceResponse::for_request(&batch[0], ActionType::Combat, 1, 0.85, 0)
            .with_latency(1.0);
        queue.write_responses(&[response]).await.unwrap();

        // Recent rows survive
        assert_eq!(queue.cleanup_old_requests(24).await.unwrap(), 0);

        backdate(&queue, "ai_requests", 48);
        backdate(&queue, "ai_responses", 48);

        // Only the completed request goes; the pending one stays
        assert_eq!(queue.cleanup_old_requests(24).await.unwrap(), 1);
        assert_eq!(queue.pending_count().unwrap(), 1);

        // Unread responses are kept until the game server reads them
        assert_eq!(queue.cleanup_old_responses(24).await.unwrap(), 0);
        queue.take_response(batch[0].request_id).unwrap();
        assert_eq!(queue.cleanup_old_responses(24).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        {
            let queue = SqliteQueue::open(&path, Duration::from_millis(10)).unwrap();
            queue.enqueue(&request(1, 0)).unwrap();
            queue.ping().unwrap();
            queue.close().await;
        }
        let queue = SqliteQueue::open(&path, Duration::from_millis(10)).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 1);
        assert_eq!(queue.poll_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_release_requests_returns_claims_to_pending() {
        let queue = queue();
        let first = queue.enqueue(&request(1, 0)).unwrap();
        let second = queue.enqueue(&request(2, 0)).unwrap();
        let batch = queue.poll_requests(10).await.unwrap();
        assert_eq!(batch.len(), 2);

        let response = InferenceResponse::for_request(&batch[1], ActionType::Combat, 1, 0.85, 0)
            .with_latency(1.0);
        queue.write_responses(&[response]).await.unwrap();

        // Completed rows stay completed
        assert_eq!(queue.release_requests(&[first, second]).await.unwrap(), 1);
        assert_eq!(queue.request_status(first).unwrap(), Some(RequestStatus::Pending));
        assert_eq!(queue.request_status(second).unwrap(), Some(RequestStatus::Completed));

        let again = queue.poll_requests(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].request_id, first);
        assert_eq!(queue.release_requests(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_stale_claims() {
        let queue = queue();
        let stuck = queue.enqueue(&request(1, 0)).unwrap();
        let fresh = queue.enqueue(&request(2, 0)).unwrap();
        queue.poll_requests(10).await.unwrap();

        let old = timestamp(Utc::now() - ChronoDuration::minutes(30));
        queue
            .conn()
            .unwrap()
            .execute(
                "UPDATE ai_requests SET processed_at = ?1 WHERE request_id = ?2",
                params![old, stuck],
            )
            .unwrap();

        assert_eq!(queue.reclaim_stale(Duration::from_secs(300)).await.unwrap(), 1);
        assert_eq!(queue.request_status(stuck).unwrap(), Some(RequestStatus::Pending));
        assert_eq!(queue.request_status(fresh).unwrap(), Some(RequestStatus::Processing));
        assert_eq!(queue.reclaim_stale(Duration::from_secs(300)).await.unwrap(), 0);
    }
}
