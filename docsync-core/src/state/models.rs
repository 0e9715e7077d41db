use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a `SyncRecord`, per the state machine in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Error,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            "failed" => Ok(SyncStatus::Failed),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Persisted view of one (doctype, docname) pair: the hashes and status
/// observed at the last sync attempt, used by the resolver to detect which
/// side, if either, has changed since.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct SyncRecord {
    pub doctype: String,
    pub docname: String,
    pub cloud_hash: String,
    pub local_hash: String,
    pub cloud_modified: Option<String>,
    pub local_modified: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_direction: Option<String>,
    pub is_syncing: bool,
    pub status: String,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    /// A fresh record for a key never synced before - both hashes empty,
    /// so the resolver treats any existing content on either side as new.
    pub fn pending(
        doctype: impl Into<String>,
        docname: impl Into<String>,
        cloud_hash: impl Into<String>,
        local_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            doctype: doctype.into(),
            docname: docname.into(),
            cloud_hash: cloud_hash.into(),
            local_hash: local_hash.into(),
            cloud_modified: None,
            local_modified: None,
            last_synced_at: None,
            last_direction: None,
            is_syncing: false,
            status: SyncStatus::Pending.as_str().to_string(),
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.parse().unwrap_or(SyncStatus::Pending)
    }
}

/// One row of the append-only audit trail - every sync attempt, whether it
/// succeeded, was skipped, conflicted, or failed.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub doctype: String,
    pub docname: String,
    pub action: Option<String>,
    pub direction: Option<String>,
    pub outcome: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// A conflict awaiting or having received a resolution.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub doctype: String,
    pub docname: String,
    pub cloud_snapshot: String,
    pub local_snapshot: String,
    pub resolution: Option<String>,
    pub resolved_direction: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// One queued webhook notification awaiting processing by the background
/// worker.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct WebhookQueueItem {
    pub id: i64,
    pub source: String,
    pub doctype: String,
    pub docname: String,
    pub action: String,
    pub payload: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processing: bool,
    pub processed: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}
