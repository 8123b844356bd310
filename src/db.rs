//! SQLite-based pipeline state.
//!
//! The database lives at `~/.sessionflow/sessions.db` and is the system of
//! record for transcripts, clients, analysis attempts, and the activity log.
//! Status counts are always derived by query; no counters are stored.
//!
//! The connection is intentionally NOT `Clone` or `Sync`. It is held behind
//! a `std::sync::Mutex` in `AppState`; every transition and the dedup check
//! in `submit_or_skip` run under that lock, which is what makes them atomic.

use std::path::PathBuf;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ActivityStatus, Confidence, TranscriptStatus};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Transcript not found: {0}")]
    TranscriptNotFound(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("No selected analysis for transcript: {0}")]
    AnalysisNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// A row from the `clients` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbClient {
    pub id: String,
    pub display_name: String,
    pub normalized_name: String,
    pub store_container_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `transcripts` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTranscript {
    pub id: String,
    pub client_id: Option<String>,
    pub source_filename: String,
    pub content_hash: String,
    pub declared_mime: Option<String>,
    pub status: TranscriptStatus,
    pub error_detail: Option<String>,
    pub word_count: Option<i64>,
    pub session_date: Option<String>,
    pub resolution_confidence: Option<String>,
    pub sync_attempts: i64,
    pub next_sync_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// A row from the `analysis_results` table. One row per provider attempt,
/// success or failure; at most one row per transcript carries `selected`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAnalysisResult {
    pub id: String,
    pub transcript_id: String,
    pub provider_name: String,
    pub attempt_number: i64,
    pub attempted_at: String,
    pub succeeded: bool,
    pub selected: bool,
    pub latency_ms: Option<i64>,
    pub normalized_payload: Option<String>,
    pub raw_payload: Option<String>,
    pub error_detail: Option<String>,
}

/// A row from the `activity_log` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbActivity {
    pub id: i64,
    pub transcript_id: Option<String>,
    pub event: String,
    pub detail: Option<String>,
    pub status: String,
    pub created_at: String,
}

/// Outcome of a dedup-checked submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New transcript enqueued as Pending.
    New(String),
    /// Same content is already queued or processing; nothing enqueued.
    DuplicateInFlight(String),
    /// Same content already completed; nothing enqueued.
    DuplicateCompleted(String),
}

/// Derived status counts for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub total: i64,
    pub pending: i64,
    pub in_flight: i64,
    pub completed: i64,
    pub completed_with_sync_error: i64,
    pub failed: i64,
}

/// SQLite connection wrapper for pipeline state.
pub struct PipelineDb {
    conn: Connection,
}

impl PipelineDb {
    /// Open (or create) the database at `~/.sessionflow/sessions.db` and
    /// apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing and for the
    /// `dbPath` config override.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // Schema statements all use IF NOT EXISTS, so this is idempotent
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.sessionflow/sessions.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".sessionflow").join("sessions.db"))
    }

    // =========================================================================
    // Submission and dedup
    // =========================================================================

    /// Dedup-checked enqueue. Both the scheduler scan and manual submission
    /// funnel through here.
    ///
    /// A duplicate is any prior transcript with the same content hash that is
    /// still in flight or finished with its analysis intact. A prior `Failed`
    /// transcript does not block resubmission.
    pub fn submit_or_skip(
        &self,
        source_filename: &str,
        content_hash: &str,
        declared_mime: Option<&str>,
    ) -> Result<SubmitOutcome, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, status FROM transcripts
             WHERE content_hash = ?1
             ORDER BY created_at DESC",
        )?;
        let existing: Vec<(String, String)> = stmt
            .query_map(params![content_hash], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (id, status) in &existing {
            match TranscriptStatus::parse(status) {
                Some(s) if !s.is_terminal() => {
                    return Ok(SubmitOutcome::DuplicateInFlight(id.clone()));
                }
                Some(TranscriptStatus::Completed)
                | Some(TranscriptStatus::CompletedWithSyncError) => {
                    return Ok(SubmitOutcome::DuplicateCompleted(id.clone()));
                }
                _ => {}
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO transcripts (id, source_filename, content_hash, declared_mime,
                                      status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![id, source_filename, content_hash, declared_mime, now],
        )?;
        self.log_activity(
            Some(&id),
            "received",
            Some(source_filename),
            ActivityStatus::Info,
        )?;
        Ok(SubmitOutcome::New(id))
    }

    // =========================================================================
    // Transcripts
    // =========================================================================

    pub fn get_transcript(&self, id: &str) -> Result<Option<DbTranscript>, DbError> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", TRANSCRIPT_SELECT),
                params![id],
                row_to_transcript,
            )
            .optional()?;
        Ok(result)
    }

    pub fn transcripts_with_status(
        &self,
        status: TranscriptStatus,
    ) -> Result<Vec<DbTranscript>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = ?1 ORDER BY created_at",
            TRANSCRIPT_SELECT
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_transcript)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Move a transcript to a new status, enforcing the transition table.
    ///
    /// Every change appends an activity row. Completion timestamps are set
    /// when entering a completed state.
    pub fn transition(
        &self,
        id: &str,
        to: TranscriptStatus,
    ) -> Result<(), DbError> {
        let current = self
            .get_transcript(id)?
            .ok_or_else(|| DbError::TranscriptNotFound(id.to_string()))?;

        if !current.status.can_transition_to(to) {
            return Err(DbError::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = matches!(
            to,
            TranscriptStatus::Completed | TranscriptStatus::CompletedWithSyncError
        )
        .then(|| now.clone());

        self.conn.execute(
            "UPDATE transcripts
             SET status = ?1, updated_at = ?2,
                 completed_at = COALESCE(?3, completed_at)
             WHERE id = ?4",
            params![to.as_str(), now, completed_at, id],
        )?;

        let activity_status = match to {
            TranscriptStatus::Completed => ActivityStatus::Success,
            TranscriptStatus::CompletedWithSyncError => ActivityStatus::Warning,
            TranscriptStatus::Failed => ActivityStatus::Error,
            _ => ActivityStatus::Info,
        };
        self.log_activity(
            Some(id),
            "status_changed",
            Some(&format!("{} -> {}", current.status.as_str(), to.as_str())),
            activity_status,
        )?;
        Ok(())
    }

    /// Transition to Failed with a reason.
    pub fn fail(&self, id: &str, detail: &str) -> Result<(), DbError> {
        self.transition(id, TranscriptStatus::Failed)?;
        self.conn.execute(
            "UPDATE transcripts SET error_detail = ?1 WHERE id = ?2",
            params![detail, id],
        )?;
        self.log_activity(Some(id), "failed", Some(detail), ActivityStatus::Error)?;
        Ok(())
    }

    /// Operator retry of a Failed transcript. Clears the error but keeps the
    /// activity history and prior analysis attempts.
    pub fn retry_failed(&self, id: &str) -> Result<(), DbError> {
        self.transition(id, TranscriptStatus::Pending)?;
        self.conn.execute(
            "UPDATE transcripts SET error_detail = NULL, sync_attempts = 0,
                                    next_sync_at = NULL
             WHERE id = ?1",
            params![id],
        )?;
        self.log_activity(Some(id), "retry_requested", None, ActivityStatus::Info)?;
        Ok(())
    }

    /// Store extracted text and its word count.
    pub fn set_content(
        &self,
        id: &str,
        raw_content: &str,
        word_count: usize,
    ) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "UPDATE transcripts SET raw_content = ?1, word_count = ?2, updated_at = ?3
             WHERE id = ?4",
            params![raw_content, word_count as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(DbError::TranscriptNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get_content(&self, id: &str) -> Result<Option<String>, DbError> {
        let content = self
            .conn
            .query_row(
                "SELECT raw_content FROM transcripts WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(content)
    }

    /// Attach the resolved identity to a transcript.
    pub fn set_identity(
        &self,
        id: &str,
        client_id: &str,
        session_date: Option<&str>,
        confidence: Confidence,
    ) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "UPDATE transcripts
             SET client_id = ?1, session_date = ?2, resolution_confidence = ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                client_id,
                session_date,
                confidence.as_str(),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(DbError::TranscriptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a sync attempt: bump the counter and set (or clear) the next
    /// retry deadline. Returns the new attempt count.
    pub fn record_sync_attempt(
        &self,
        id: &str,
        next_sync_at: Option<&str>,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            "UPDATE transcripts
             SET sync_attempts = sync_attempts + 1, next_sync_at = ?1, updated_at = ?2
             WHERE id = ?3",
            params![next_sync_at, Utc::now().to_rfc3339(), id],
        )?;
        let count = self
            .conn
            .query_row(
                "SELECT sync_attempts FROM transcripts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| DbError::TranscriptNotFound(id.to_string()))?;
        Ok(count)
    }

    /// Set the sync retry deadline without recording an attempt. Used when
    /// deferring after a failed attempt and when a restart finds a Syncing
    /// transcript with no deadline.
    pub fn schedule_sync_retry(&self, id: &str, next_sync_at: &str) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "UPDATE transcripts SET next_sync_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![next_sync_at, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(DbError::TranscriptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Transcripts stuck in Syncing whose retry deadline has passed.
    pub fn due_sync_retries(&self, now_iso: &str) -> Result<Vec<DbTranscript>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = 'syncing' AND next_sync_at IS NOT NULL
                 AND next_sync_at <= ?1
             ORDER BY next_sync_at",
            TRANSCRIPT_SELECT
        ))?;
        let rows = stmt
            .query_map(params![now_iso], row_to_transcript)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// Look up a client by normalized name, creating it if absent.
    /// Idempotent: resubmitting the same client name always returns the same
    /// row.
    pub fn find_or_create_client(
        &self,
        display_name: &str,
        normalized_name: &str,
    ) -> Result<DbClient, DbError> {
        if let Some(existing) = self
            .conn
            .query_row(
                "SELECT id, display_name, normalized_name, store_container_ref,
                        created_at, updated_at
                 FROM clients WHERE normalized_name = ?1",
                params![normalized_name],
                row_to_client,
            )
            .optional()?
        {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO clients (id, display_name, normalized_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, display_name, normalized_name, now],
        )?;
        Ok(DbClient {
            id,
            display_name: display_name.to_string(),
            normalized_name: normalized_name.to_string(),
            store_container_ref: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_client(&self, id: &str) -> Result<Option<DbClient>, DbError> {
        let client = self
            .conn
            .query_row(
                "SELECT id, display_name, normalized_name, store_container_ref,
                        created_at, updated_at
                 FROM clients WHERE id = ?1",
                params![id],
                row_to_client,
            )
            .optional()?;
        Ok(client)
    }

    /// Persist the external container ref on the client. Written before any
    /// record lands in the container so a crash cannot orphan it.
    pub fn set_client_container(
        &self,
        client_id: &str,
        container_ref: &str,
    ) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "UPDATE clients SET store_container_ref = ?1, updated_at = ?2 WHERE id = ?3",
            params![container_ref, Utc::now().to_rfc3339(), client_id],
        )?;
        if changed == 0 {
            return Err(DbError::ClientNotFound(client_id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Analysis results
    // =========================================================================

    /// Record one provider attempt, success or failure. Returns the row id.
    #[allow(clippy::too_many_arguments)]
    pub fn record_analysis_attempt(
        &self,
        transcript_id: &str,
        provider_name: &str,
        attempt_number: i64,
        succeeded: bool,
        latency_ms: Option<i64>,
        normalized_payload: Option<&str>,
        raw_payload: Option<&str>,
        error_detail: Option<&str>,
    ) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO analysis_results (id, transcript_id, provider_name, attempt_number,
                                           attempted_at, succeeded, latency_ms,
                                           normalized_payload, raw_payload, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                transcript_id,
                provider_name,
                attempt_number,
                Utc::now().to_rfc3339(),
                succeeded,
                latency_ms,
                normalized_payload,
                raw_payload,
                error_detail
            ],
        )?;
        Ok(id)
    }

    /// Mark one result as the selected analysis for its transcript,
    /// clearing any previous selection first so at most one row is selected.
    pub fn mark_selected(&self, transcript_id: &str, result_id: &str) -> Result<(), DbError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE analysis_results SET selected = 0 WHERE transcript_id = ?1",
            params![transcript_id],
        )?;
        tx.execute(
            "UPDATE analysis_results SET selected = 1 WHERE id = ?1 AND transcript_id = ?2",
            params![result_id, transcript_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn selected_analysis(
        &self,
        transcript_id: &str,
    ) -> Result<Option<DbAnalysisResult>, DbError> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE transcript_id = ?1 AND selected = 1",
                    ANALYSIS_SELECT
                ),
                params![transcript_id],
                row_to_analysis,
            )
            .optional()?;
        Ok(result)
    }

    /// All attempts for a transcript, in the order they were made.
    pub fn analysis_attempts(
        &self,
        transcript_id: &str,
    ) -> Result<Vec<DbAnalysisResult>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE transcript_id = ?1 ORDER BY attempted_at, attempt_number",
            ANALYSIS_SELECT
        ))?;
        let rows = stmt
            .query_map(params![transcript_id], row_to_analysis)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Activity log and counts
    // =========================================================================

    /// Append to the activity log. Append-only; nothing updates or deletes
    /// these rows.
    pub fn log_activity(
        &self,
        transcript_id: Option<&str>,
        event: &str,
        detail: Option<&str>,
        status: ActivityStatus,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO activity_log (transcript_id, event, detail, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                transcript_id,
                event,
                detail,
                status.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn recent_activity(&self, limit: i64) -> Result<Vec<DbActivity>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, transcript_id, event, detail, status, created_at
             FROM activity_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_activity)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// The full activity history of one transcript, oldest first. Unlike
    /// `recent_activity` this never truncates, so the audit trail of an old
    /// transcript survives a busy log.
    pub fn transcript_activity(&self, transcript_id: &str) -> Result<Vec<DbActivity>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, transcript_id, event, detail, status, created_at
             FROM activity_log
             WHERE transcript_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![transcript_id], row_to_activity)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Derive status counts by query.
    pub fn status_counts(&self) -> Result<StatusCounts, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM transcripts GROUP BY status")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.total += n;
            match TranscriptStatus::parse(&status) {
                Some(TranscriptStatus::Pending) => counts.pending += n,
                Some(TranscriptStatus::Extracting)
                | Some(TranscriptStatus::Resolving)
                | Some(TranscriptStatus::Analyzing)
                | Some(TranscriptStatus::Syncing) => counts.in_flight += n,
                Some(TranscriptStatus::Completed) => counts.completed += n,
                Some(TranscriptStatus::CompletedWithSyncError) => {
                    counts.completed_with_sync_error += n
                }
                Some(TranscriptStatus::Failed) => counts.failed += n,
                None => {}
            }
        }
        Ok(counts)
    }

    /// All transcripts for a client, most recent session first.
    pub fn client_sessions(&self, client_id: &str) -> Result<Vec<DbTranscript>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE client_id = ?1
             ORDER BY session_date DESC, created_at DESC",
            TRANSCRIPT_SELECT
        ))?;
        let rows = stmt
            .query_map(params![client_id], row_to_transcript)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}

const TRANSCRIPT_SELECT: &str =
    "SELECT id, client_id, source_filename, content_hash, declared_mime, status,
            error_detail, word_count, session_date, resolution_confidence,
            sync_attempts, next_sync_at, created_at, updated_at, completed_at
     FROM transcripts";

const ANALYSIS_SELECT: &str =
    "SELECT id, transcript_id, provider_name, attempt_number, attempted_at,
            succeeded, selected, latency_ms, normalized_payload, raw_payload,
            error_detail
     FROM analysis_results";

fn row_to_transcript(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbTranscript> {
    let status_str: String = row.get(5)?;
    let status = TranscriptStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown status: {}", status_str).into(),
        )
    })?;
    Ok(DbTranscript {
        id: row.get(0)?,
        client_id: row.get(1)?,
        source_filename: row.get(2)?,
        content_hash: row.get(3)?,
        declared_mime: row.get(4)?,
        status,
        error_detail: row.get(6)?,
        word_count: row.get(7)?,
        session_date: row.get(8)?,
        resolution_confidence: row.get(9)?,
        sync_attempts: row.get(10)?,
        next_sync_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbClient> {
    Ok(DbClient {
        id: row.get(0)?,
        display_name: row.get(1)?,
        normalized_name: row.get(2)?,
        store_container_ref: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbActivity> {
    Ok(DbActivity {
        id: row.get(0)?,
        transcript_id: row.get(1)?,
        event: row.get(2)?,
        detail: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbAnalysisResult> {
    Ok(DbAnalysisResult {
        id: row.get(0)?,
        transcript_id: row.get(1)?,
        provider_name: row.get(2)?,
        attempt_number: row.get(3)?,
        attempted_at: row.get(4)?,
        succeeded: row.get(5)?,
        selected: row.get(6)?,
        latency_ms: row.get(7)?,
        normalized_payload: row.get(8)?,
        raw_payload: row.get(9)?,
        error_detail: row.get(10)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of
    /// the test. Test temp dirs are cleaned up by the OS.
    pub(crate) fn test_db() -> PipelineDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test_sessions.db");
        std::mem::forget(dir);
        PipelineDb::open_at(path).expect("Failed to open test database")
    }

    fn submit(db: &PipelineDb, filename: &str, hash: &str) -> String {
        match db.submit_or_skip(filename, hash, Some("text/plain")).expect("submit") {
            SubmitOutcome::New(id) => id,
            other => panic!("expected new transcript, got {:?}", other),
        }
    }

    /// Drive a transcript through the happy path up to the given status.
    fn advance_to(db: &PipelineDb, id: &str, target: TranscriptStatus) {
        use TranscriptStatus::*;
        for step in [Extracting, Resolving, Analyzing, Syncing, Completed] {
            db.transition(id, step).expect("transition");
            if step == target {
                return;
            }
        }
    }

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        for table in ["clients", "transcripts", "analysis_results", "activity_log"] {
            let count: i32 = db
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .expect("table should exist");
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_submit_creates_pending_with_activity() {
        let db = test_db();
        let id = submit(&db, "jordan_2024-03-11.txt", "hash-a");

        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Pending);
        assert_eq!(t.source_filename, "jordan_2024-03-11.txt");
        assert_eq!(t.sync_attempts, 0);

        let activity = db.recent_activity(10).unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].event, "received");
    }

    #[test]
    fn test_duplicate_in_flight_not_enqueued() {
        let db = test_db();
        let first = submit(&db, "a.txt", "hash-dup");

        let outcome = db.submit_or_skip("a-copy.txt", "hash-dup", None).unwrap();
        assert_eq!(outcome, SubmitOutcome::DuplicateInFlight(first.clone()));

        // Still a duplicate while mid-pipeline.
        advance_to(&db, &first, TranscriptStatus::Analyzing);
        let outcome = db.submit_or_skip("a-copy.txt", "hash-dup", None).unwrap();
        assert_eq!(outcome, SubmitOutcome::DuplicateInFlight(first));
    }

    #[test]
    fn test_duplicate_of_completed() {
        let db = test_db();
        let first = submit(&db, "a.txt", "hash-done");
        advance_to(&db, &first, TranscriptStatus::Completed);

        let outcome = db.submit_or_skip("again.txt", "hash-done", None).unwrap();
        assert_eq!(outcome, SubmitOutcome::DuplicateCompleted(first));
    }

    #[test]
    fn test_failed_does_not_block_resubmission() {
        let db = test_db();
        let first = submit(&db, "a.txt", "hash-fail");
        db.transition(&first, TranscriptStatus::Extracting).unwrap();
        db.fail(&first, "corrupt").unwrap();

        let outcome = db.submit_or_skip("a.txt", "hash-fail", None).unwrap();
        assert!(matches!(outcome, SubmitOutcome::New(_)));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h1");

        let err = db.transition(&id, TranscriptStatus::Analyzing).unwrap_err();
        match err {
            DbError::InvalidTransition { from, to } => {
                assert_eq!(from, "pending");
                assert_eq!(to, "analyzing");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Status unchanged after the rejected transition.
        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Pending);
    }

    #[test]
    fn test_completed_sets_completed_at() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h2");
        advance_to(&db, &id, TranscriptStatus::Completed);

        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Completed);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_fail_and_retry_clears_error_keeps_history() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h3");
        db.transition(&id, TranscriptStatus::Extracting).unwrap();
        db.fail(&id, "all providers failed: openai: timeout").unwrap();

        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Failed);
        assert!(t.error_detail.as_deref().unwrap().contains("timeout"));

        db.retry_failed(&id).unwrap();
        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.status, TranscriptStatus::Pending);
        assert!(t.error_detail.is_none());

        // Activity history survives the retry.
        let events: Vec<String> = db
            .recent_activity(50)
            .unwrap()
            .into_iter()
            .map(|a| a.event)
            .collect();
        assert!(events.contains(&"failed".to_string()));
        assert!(events.contains(&"retry_requested".to_string()));
    }

    #[test]
    fn test_retry_only_from_failed() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h4");
        advance_to(&db, &id, TranscriptStatus::Completed);
        assert!(db.retry_failed(&id).is_err());
    }

    #[test]
    fn test_find_or_create_client_idempotent() {
        let db = test_db();
        let a = db.find_or_create_client("Jordan Lee", "jordan lee").unwrap();
        let b = db.find_or_create_client("JORDAN  LEE", "jordan lee").unwrap();
        assert_eq!(a.id, b.id);
        // First spelling wins for display.
        assert_eq!(b.display_name, "Jordan Lee");
    }

    #[test]
    fn test_set_identity_and_client_sessions() {
        let db = test_db();
        let client = db.find_or_create_client("Jordan Lee", "jordan lee").unwrap();

        let t1 = submit(&db, "one.txt", "h5");
        let t2 = submit(&db, "two.txt", "h6");
        db.set_identity(&t1, &client.id, Some("2024-03-11"), Confidence::High)
            .unwrap();
        db.set_identity(&t2, &client.id, Some("2024-03-18"), Confidence::Medium)
            .unwrap();

        let sessions = db.client_sessions(&client.id).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_date.as_deref(), Some("2024-03-18"));
        assert_eq!(sessions[1].resolution_confidence.as_deref(), Some("high"));
    }

    #[test]
    fn test_selected_analysis_invariant() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h7");

        let fail_id = db
            .record_analysis_attempt(&id, "openai", 1, false, Some(1200), None, None, Some("429"))
            .unwrap();
        let ok_id = db
            .record_analysis_attempt(
                &id,
                "anthropic",
                1,
                true,
                Some(900),
                Some("{\"summary\":\"s\"}"),
                Some("{}"),
                None,
            )
            .unwrap();

        db.mark_selected(&id, &ok_id).unwrap();
        let selected = db.selected_analysis(&id).unwrap().unwrap();
        assert_eq!(selected.id, ok_id);
        assert_eq!(selected.provider_name, "anthropic");

        // Re-selecting moves the flag rather than duplicating it.
        db.mark_selected(&id, &fail_id).unwrap();
        let attempts = db.analysis_attempts(&id).unwrap();
        assert_eq!(attempts.iter().filter(|a| a.selected).count(), 1);
    }

    #[test]
    fn test_all_attempts_recorded_in_order() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h8");
        for (n, provider) in [(1, "openai"), (2, "openai"), (1, "anthropic")] {
            db.record_analysis_attempt(&id, provider, n, false, None, None, None, Some("boom"))
                .unwrap();
        }
        let attempts = db.analysis_attempts(&id).unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| !a.succeeded));
    }

    #[test]
    fn test_status_counts_derived() {
        let db = test_db();
        let a = submit(&db, "a.txt", "ha");
        let b = submit(&db, "b.txt", "hb");
        let c = submit(&db, "c.txt", "hc");
        let d = submit(&db, "d.txt", "hd");

        advance_to(&db, &a, TranscriptStatus::Completed);
        advance_to(&db, &b, TranscriptStatus::Analyzing);
        db.transition(&c, TranscriptStatus::Extracting).unwrap();
        db.fail(&c, "corrupt").unwrap();
        advance_to(&db, &d, TranscriptStatus::Syncing);
        db.transition(&d, TranscriptStatus::CompletedWithSyncError)
            .unwrap();

        let counts = db.status_counts().unwrap();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.completed_with_sync_error, 1);
        assert_eq!(counts.pending, 0);
    }

    #[test]
    fn test_sync_retry_bookkeeping() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h9");
        advance_to(&db, &id, TranscriptStatus::Syncing);

        let n = db.record_sync_attempt(&id, Some("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(n, 1);
        let n = db.record_sync_attempt(&id, Some("2026-01-01T00:02:00Z")).unwrap();
        assert_eq!(n, 2);

        let due = db.due_sync_retries("2026-01-01T00:05:00Z").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);

        // Not due yet before the deadline.
        assert!(db.due_sync_retries("2026-01-01T00:01:00Z").unwrap().is_empty());

        // Clearing the deadline removes it from the sweep.
        db.conn
            .execute(
                "UPDATE transcripts SET next_sync_at = NULL WHERE id = ?1",
                params![id],
            )
            .unwrap();
        assert!(db.due_sync_retries("2026-01-01T00:05:00Z").unwrap().is_empty());
    }

    #[test]
    fn test_transcripts_with_status_in_submission_order() {
        let db = test_db();
        let a = submit(&db, "a.txt", "hs1");
        let b = submit(&db, "b.txt", "hs2");
        let c = submit(&db, "c.txt", "hs3");
        db.transition(&b, TranscriptStatus::Extracting).unwrap();

        let pending = db.transcripts_with_status(TranscriptStatus::Pending).unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), c.as_str()]);

        let extracting = db
            .transcripts_with_status(TranscriptStatus::Extracting)
            .unwrap();
        assert_eq!(extracting.len(), 1);
        assert_eq!(extracting[0].id, b);
    }

    #[test]
    fn test_schedule_sync_retry_does_not_count_attempt() {
        let db = test_db();
        let id = submit(&db, "a.txt", "hs4");
        advance_to(&db, &id, TranscriptStatus::Syncing);

        db.schedule_sync_retry(&id, "2026-01-01T00:00:00Z").unwrap();
        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.sync_attempts, 0);
        assert_eq!(t.next_sync_at.as_deref(), Some("2026-01-01T00:00:00Z"));

        let due = db.due_sync_retries("2026-01-01T00:01:00Z").unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_missing_client_reported_as_client_not_found() {
        let db = test_db();
        let err = db.set_client_container("no-such-client", "ref").unwrap_err();
        assert!(matches!(err, DbError::ClientNotFound(_)));
    }

    #[test]
    fn test_transcript_activity_survives_busy_log() {
        let db = test_db();
        let old = submit(&db, "old.txt", "hact");

        // Flood the global log well past any dashboard window.
        for n in 0..300 {
            db.log_activity(None, "scan_noise", Some(&n.to_string()), ActivityStatus::Info)
                .unwrap();
        }

        let activity = db.transcript_activity(&old).unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].event, "received");

        // The bounded global view no longer reaches it.
        assert!(db
            .recent_activity(200)
            .unwrap()
            .iter()
            .all(|a| a.transcript_id.as_deref() != Some(old.as_str())));
    }

    #[test]
    fn test_content_roundtrip() {
        let db = test_db();
        let id = submit(&db, "a.txt", "h10");
        db.set_content(&id, "Therapist: hello", 2).unwrap();

        assert_eq!(db.get_content(&id).unwrap().as_deref(), Some("Therapist: hello"));
        let t = db.get_transcript(&id).unwrap().unwrap();
        assert_eq!(t.word_count, Some(2));
    }
}
