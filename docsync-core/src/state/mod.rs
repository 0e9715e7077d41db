pub mod models;

use crate::error::{Result, SyncError};
use chrono::Utc;
use models::{ConflictRecord, SyncLogEntry, SyncRecord, WebhookQueueItem};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Window, in minutes, after which a claimed-but-unfinished sync or queue
/// item is considered abandoned (process crash) and eligible to be
/// reclaimed. See §4.2 / §4.6.
const STALE_CLAIM_MINUTES: i64 = 5;

/// Async SQLite-backed persistence for sync records, the audit log,
/// conflicts, and the webhook intake queue.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Opens (creating if absent) the SQLite database at `path` and applies
    /// the schema. `PRAGMA journal_mode = WAL` lets the webhook intake
    /// handler and the background worker hit the same file concurrently
    /// without blocking each other on every write.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| SyncError::Storage(format!("invalid database path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests: each connection in the pool would
    /// otherwise see its own empty database, so the pool is capped at one.
    /// Not cfg-gated so integration tests in `tests/` can reach it too.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_records (
                doctype TEXT NOT NULL,
                docname TEXT NOT NULL,
                cloud_hash TEXT NOT NULL DEFAULT '',
                local_hash TEXT NOT NULL DEFAULT '',
                cloud_modified TEXT,
                local_modified TEXT,
                last_synced_at TEXT,
                last_direction TEXT,
                is_syncing INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                claimed_at TEXT,
                PRIMARY KEY (doctype, docname)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doctype TEXT NOT NULL,
                docname TEXT NOT NULL,
                action TEXT,
                direction TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                occurred_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doctype TEXT NOT NULL,
                docname TEXT NOT NULL,
                cloud_snapshot TEXT NOT NULL,
                local_snapshot TEXT NOT NULL,
                resolution TEXT,
                resolved_direction TEXT,
                detected_at TEXT NOT NULL,
                resolved_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                doctype TEXT NOT NULL,
                docname TEXT NOT NULL,
                action TEXT NOT NULL DEFAULT 'update',
                payload TEXT,
                received_at TEXT NOT NULL,
                processing INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_webhook_queue_processed ON webhook_queue (processed, received_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_log_occurred_at ON sync_log (occurred_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA user_version = 1").execute(&self.pool).await?;

        Ok(())
    }

    /// Fetches the sync record for `(doctype, docname)`, or a fresh
    /// `SyncRecord::pending` if none exists yet. Never creates a row -
    /// callers that proceed to sync persist via `save_sync_record`.
    const SYNC_RECORD_COLUMNS: &'static str = "doctype, docname, cloud_hash, local_hash, cloud_modified, local_modified, \
         last_synced_at, last_direction, is_syncing, status, error_message, retry_count, created_at, updated_at";

    pub async fn get_sync_record(&self, doctype: &str, docname: &str) -> Result<SyncRecord> {
        let query = format!(
            "SELECT {} FROM sync_records WHERE doctype = ? AND docname = ?",
            Self::SYNC_RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, SyncRecord>(&query)
            .bind(doctype)
            .bind(docname)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.unwrap_or_else(|| SyncRecord::pending(doctype, docname, "", "")))
    }

    pub async fn all_sync_records(&self, doctype: Option<&str>) -> Result<Vec<SyncRecord>> {
        let rows = match doctype {
            Some(dt) => {
                let query = format!(
                    "SELECT {} FROM sync_records WHERE doctype = ? ORDER BY docname",
                    Self::SYNC_RECORD_COLUMNS
                );
                sqlx::query_as::<_, SyncRecord>(&query)
                    .bind(dt)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM sync_records ORDER BY doctype, docname",
                    Self::SYNC_RECORD_COLUMNS
                );
                sqlx::query_as::<_, SyncRecord>(&query).fetch_all(&self.pool).await?
            }
        };
        Ok(rows)
    }

    /// Upserts the post-sync state of a key. Called after a successful
    /// write to either side, after a no-op decision, and after a conflict
    /// is filed (to clear `is_syncing`).
    pub async fn save_sync_record(&self, record: &SyncRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (
                doctype, docname, cloud_hash, local_hash, cloud_modified, local_modified,
                last_synced_at, last_direction, is_syncing, status, error_message, retry_count,
                created_at, updated_at, claimed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT (doctype, docname) DO UPDATE SET
                cloud_hash = excluded.cloud_hash,
                local_hash = excluded.local_hash,
                cloud_modified = excluded.cloud_modified,
                local_modified = excluded.local_modified,
                last_synced_at = excluded.last_synced_at,
                last_direction = excluded.last_direction,
                is_syncing = excluded.is_syncing,
                status = excluded.status,
                error_message = excluded.error_message,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at,
                claimed_at = NULL
            "#,
        )
        .bind(&record.doctype)
        .bind(&record.docname)
        .bind(&record.cloud_hash)
        .bind(&record.local_hash)
        .bind(&record.cloud_modified)
        .bind(&record.local_modified)
        .bind(record.last_synced_at)
        .bind(&record.last_direction)
        .bind(record.is_syncing)
        .bind(&record.status)
        .bind(&record.error_message)
        .bind(record.retry_count)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts sync records grouped by status, for the `status` CLI command.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_records GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Atomically claims a key for sync: sets `is_syncing` only if it is
    /// currently unset (or stale), returning whether the claim succeeded.
    /// This is the cross-restart backstop behind the in-process per-key
    /// mutex in the executor - a crash mid-sync leaves `is_syncing = 1` in
    /// the database, which a fresh process must be able to reclaim after
    /// `STALE_CLAIM_MINUTES` rather than deadlock forever.
    pub async fn try_claim(&self, doctype: &str, docname: &str) -> Result<bool> {
        let now = Utc::now();
        let stale_before = now - chrono::Duration::minutes(STALE_CLAIM_MINUTES);

        sqlx::query(
            r#"
            INSERT INTO sync_records (doctype, docname, is_syncing, created_at, updated_at, claimed_at)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT (doctype, docname) DO UPDATE SET
                is_syncing = 1,
                claimed_at = excluded.claimed_at
            WHERE sync_records.is_syncing = 0 OR sync_records.claimed_at < ?
            "#,
        )
        .bind(doctype)
        .bind(docname)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        let claimed: (i64,) = sqlx::query_as(
            "SELECT is_syncing FROM sync_records WHERE doctype = ? AND docname = ? AND claimed_at = ?",
        )
        .bind(doctype)
        .bind(docname)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or((0,));

        Ok(claimed.0 == 1)
    }

    pub async fn release_claim(&self, doctype: &str, docname: &str) -> Result<()> {
        sqlx::query("UPDATE sync_records SET is_syncing = 0, claimed_at = NULL WHERE doctype = ? AND docname = ?")
            .bind(doctype)
            .bind(docname)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_log(
        &self,
        doctype: &str,
        docname: &str,
        action: Option<&str>,
        direction: Option<&str>,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_log (doctype, docname, action, direction, outcome, detail, occurred_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(doctype)
        .bind(docname)
        .bind(action)
        .bind(direction)
        .bind(outcome)
        .bind(detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_log(&self, limit: i64) -> Result<Vec<SyncLogEntry>> {
        let rows = sqlx::query_as::<_, SyncLogEntry>(
            "SELECT id, doctype, docname, action, direction, outcome, detail, occurred_at
             FROM sync_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn file_conflict(
        &self,
        doctype: &str,
        docname: &str,
        cloud_snapshot: &str,
        local_snapshot: &str,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO conflicts (doctype, docname, cloud_snapshot, local_snapshot, detected_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(doctype)
        .bind(docname)
        .bind(cloud_snapshot)
        .bind(local_snapshot)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn resolve_conflict(&self, id: i64, resolution: &str, direction: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE conflicts SET resolution = ?, resolved_direction = ?, resolved_at = ? WHERE id = ?",
        )
        .bind(resolution)
        .bind(direction)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The unresolved conflict already on file for this key, if any.
    /// Checked before filing a new one so that repeated detections of an
    /// unchanged divergence (e.g. under the `manual` policy, where nothing
    /// moves until an operator intervenes) reuse the same record instead of
    /// piling up duplicates.
    pub async fn open_conflict_for_key(&self, doctype: &str, docname: &str) -> Result<Option<ConflictRecord>> {
        let row = sqlx::query_as::<_, ConflictRecord>(
            "SELECT id, doctype, docname, cloud_snapshot, local_snapshot, resolution, resolved_direction, detected_at, resolved_at
             FROM conflicts WHERE doctype = ? AND docname = ? AND resolution IS NULL
             ORDER BY detected_at DESC LIMIT 1",
        )
        .bind(doctype)
        .bind(docname)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query_as::<_, ConflictRecord>(
            "SELECT id, doctype, docname, cloud_snapshot, local_snapshot, resolution, resolved_direction, detected_at, resolved_at
             FROM conflicts WHERE resolution IS NULL ORDER BY detected_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn enqueue_webhook(
        &self,
        source: &str,
        doctype: &str,
        docname: &str,
        action: &str,
        payload: Option<&str>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO webhook_queue (source, doctype, docname, action, payload, received_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(doctype)
        .bind(docname)
        .bind(action)
        .bind(payload)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically claims up to `batch` unprocessed, unclaimed items. A
    /// second claim pass first reclaims items whose `processing` flag has
    /// been stuck past `STALE_CLAIM_MINUTES` (worker crashed mid-item).
    pub async fn claim_webhook_batch(&self, batch: u32) -> Result<Vec<WebhookQueueItem>> {
        let stale_before = Utc::now() - chrono::Duration::minutes(STALE_CLAIM_MINUTES);
        sqlx::query(
            "UPDATE webhook_queue SET processing = 0 WHERE processing = 1 AND claimed_at < ?",
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM webhook_queue WHERE processed = 0 AND processing = 0 ORDER BY received_at LIMIT ?",
        )
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let item = sqlx::query_as::<_, WebhookQueueItem>(
                r#"
                UPDATE webhook_queue SET processing = 1, claimed_at = ?
                WHERE id = ? AND processing = 0
                RETURNING id, source, doctype, docname, action, payload, received_at, processing, processed, attempts, last_error
                "#,
            )
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(item) = item {
                claimed.push(item);
            }
        }
        Ok(claimed)
    }

    pub async fn mark_webhook_done(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE webhook_queue SET processed = 1, processing = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_webhook_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_queue SET processing = 0, attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes processed queue entries older than `retention_days`, keeping
    /// the table from growing unbounded in a long-running deployment.
    pub async fn prune_webhook_queue(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let result = sqlx::query("DELETE FROM webhook_queue WHERE processed = 1 AND received_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_webhook_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhook_queue WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Backs the `GET /status` endpoint: queued-but-unclaimed vs.
    /// claimed-and-in-flight counts, per §4.5/§6.
    pub async fn queue_status_counts(&self) -> Result<(i64, i64)> {
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_queue WHERE processed = 0 AND processing = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        let processing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_queue WHERE processed = 0 AND processing = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((pending, processing))
    }

    /// Startup-time backstop: a crash leaves `is_syncing = 1` rows behind
    /// with no in-process lock to match them (a fresh process starts with
    /// an empty keyed-mutex map), so every one of them is stale by
    /// definition. See §5, "on startup, clear any `is_syncing=true`...".
    pub async fn clear_all_syncing_claims(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_records SET is_syncing = 0, claimed_at = NULL WHERE is_syncing = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Lightweight reachability check backing the `/health` endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
