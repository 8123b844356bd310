//! The transcript processing pipeline.
//!
//! A worker pool drains a channel of jobs; each job carries one transcript
//! end to end through Extracting, Resolving, Analyzing, and Syncing. Stage
//! boundaries are status transitions in the database, so a restart can see
//! exactly where every transcript stopped.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::db::{DbError, SubmitOutcome};
use crate::extract;
use crate::orchestrator::AnalysisFailure;
use crate::resolver;
use crate::source::SourceError;
use crate::store::{SessionRecord, StoreError};
use crate::state::AppState;
use crate::types::{ActivityStatus, NormalizedAnalysis, TranscriptStatus};

const CANCELLED_DETAIL: &str = "cancelled by operator";

const RESTART_DETAIL: &str = "interrupted by restart";

/// Content-confidence floor below which a warning activity is logged.
const CONTENT_CONFIDENCE_WARN: f64 = 0.3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Database: {0}")]
    Db(#[from] DbError),

    #[error("Source: {0}")]
    Source(#[from] SourceError),

    #[error("Transcript not found: {0}")]
    NotFound(String),

    #[error("Transcript is not retryable from status {0}")]
    NotRetryable(String),

    #[error("Pipeline shut down")]
    Closed,
}

/// What startup recovery did.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Pending rows put back on the queue.
    pub requeued: usize,
    /// Rows moved to Failed for operator retry.
    pub parked: usize,
    /// Syncing rows handed back to the retry sweep.
    pub sync_rescheduled: usize,
}

/// One unit of work: a transcript with its raw document bytes.
#[derive(Debug)]
pub struct PipelineJob {
    pub transcript_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub declared_mime: Option<String>,
}

/// Handle for submitting work to the worker pool.
pub struct Pipeline {
    state: Arc<AppState>,
    tx: mpsc::Sender<PipelineJob>,
}

impl Pipeline {
    /// Spawn the worker pool and return the submission handle.
    pub fn start(state: Arc<AppState>) -> Self {
        let (tx, rx) = mpsc::channel::<PipelineJob>(64);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = state.config.worker_count.max(1);
        for worker in 0..workers {
            let state = state.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => {
                            log::debug!(
                                "worker {} picked up transcript {}",
                                worker,
                                job.transcript_id
                            );
                            process_job(&state, job).await;
                        }
                        None => break,
                    }
                }
            });
        }

        Self { state, tx }
    }

    /// Reconcile database state with the in-memory queue after a restart.
    ///
    /// Jobs live only in the channel, so a crash leaves rows behind: Pending
    /// rows are re-fetched from the source and re-enqueued, mid-flight rows
    /// are parked as Failed so the operator retry path applies, and Syncing
    /// rows that never got a retry deadline are handed to the sweep.
    pub async fn recover(&self) -> Result<RecoverySummary, PipelineError> {
        let mut summary = RecoverySummary::default();

        let stale = {
            let db = self.state.db();
            let mut stale = Vec::new();
            for status in [
                TranscriptStatus::Extracting,
                TranscriptStatus::Resolving,
                TranscriptStatus::Analyzing,
            ] {
                stale.extend(db.transcripts_with_status(status)?);
            }
            stale
        };
        for transcript in stale {
            log::warn!(
                "parking {} ({}): was {} at shutdown",
                transcript.id,
                transcript.source_filename,
                transcript.status.as_str()
            );
            let db = self.state.db();
            db.fail(&transcript.id, RESTART_DETAIL)?;
            summary.parked += 1;
        }

        let pending = {
            let db = self.state.db();
            db.transcripts_with_status(TranscriptStatus::Pending)?
        };
        for transcript in pending {
            match self.state.source.fetch(&transcript.source_filename).await {
                Ok(bytes) => {
                    self.enqueue(PipelineJob {
                        transcript_id: transcript.id,
                        filename: transcript.source_filename,
                        bytes,
                        declared_mime: transcript.declared_mime,
                    })
                    .await?;
                    summary.requeued += 1;
                }
                Err(e) => {
                    log::warn!(
                        "cannot requeue {}: source fetch of {} failed: {}",
                        transcript.id,
                        transcript.source_filename,
                        e
                    );
                    let db = self.state.db();
                    db.fail(
                        &transcript.id,
                        &format!("source document unavailable after restart: {}", e),
                    )?;
                    summary.parked += 1;
                }
            }
        }

        // A crash during the first sync attempt leaves Syncing with no
        // deadline, which the sweep would never pick up.
        let syncing = {
            let db = self.state.db();
            db.transcripts_with_status(TranscriptStatus::Syncing)?
        };
        for transcript in syncing {
            if transcript.next_sync_at.is_none() {
                let db = self.state.db();
                db.schedule_sync_retry(&transcript.id, &Utc::now().to_rfc3339())?;
                summary.sync_rescheduled += 1;
            }
        }

        Ok(summary)
    }

    /// Submit one document. Deduplicates by content hash; only genuinely new
    /// content is enqueued. Both the scheduler scan and manual submission
    /// come through here.
    pub async fn submit(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        declared_mime: Option<String>,
    ) -> Result<SubmitOutcome, PipelineError> {
        let hash = content_hash(&bytes);

        let outcome = {
            let db = self.state.db();
            db.submit_or_skip(filename, &hash, declared_mime.as_deref())?
        };

        match &outcome {
            SubmitOutcome::New(id) => {
                log::info!("enqueued transcript {} ({})", id, filename);
                self.enqueue(PipelineJob {
                    transcript_id: id.clone(),
                    filename: filename.to_string(),
                    bytes,
                    declared_mime,
                })
                .await?;
            }
            SubmitOutcome::DuplicateInFlight(existing) => {
                log::info!("skipping {}: duplicate of in-flight {}", filename, existing);
            }
            SubmitOutcome::DuplicateCompleted(existing) => {
                let db = self.state.db();
                db.log_activity(
                    Some(existing),
                    "duplicate_skipped",
                    Some(&format!("{} matches completed transcript", filename)),
                    ActivityStatus::Info,
                )?;
            }
        }
        Ok(outcome)
    }

    /// Operator retry of a Failed transcript: back to Pending, re-fetch the
    /// document from the source, re-enqueue.
    pub async fn retry_failed(&self, id: &str) -> Result<(), PipelineError> {
        let transcript = {
            let db = self.state.db();
            db.get_transcript(id)?
                .ok_or_else(|| PipelineError::NotFound(id.to_string()))?
        };
        if transcript.status != TranscriptStatus::Failed {
            return Err(PipelineError::NotRetryable(
                transcript.status.as_str().to_string(),
            ));
        }

        let bytes = self.state.source.fetch(&transcript.source_filename).await?;

        {
            let db = self.state.db();
            db.retry_failed(id)?;
        }
        self.enqueue(PipelineJob {
            transcript_id: id.to_string(),
            filename: transcript.source_filename,
            bytes,
            declared_mime: transcript.declared_mime,
        })
        .await
    }

    async fn enqueue(&self, job: PipelineJob) -> Result<(), PipelineError> {
        self.tx.send(job).await.map_err(|_| PipelineError::Closed)
    }
}

/// SHA-256 content hash used for dedup.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Run one transcript end to end. Failures are terminal states in the
/// database, never panics; this function always leaves the transcript in a
/// consistent status.
pub async fn process_job(state: &Arc<AppState>, job: PipelineJob) {
    let id = job.transcript_id.clone();
    if let Err(e) = run_stages(state, job).await {
        // Bookkeeping failure, not a document failure. Try to park the
        // transcript as Failed so it is visible; if even that fails, log.
        log::error!("pipeline error for {}: {}", id, e);
        let db = state.db();
        if let Err(inner) = db.fail(&id, &format!("internal error: {}", e)) {
            log::error!("could not mark {} failed: {}", id, inner);
        }
    }
    state.take_cancel(&id);
}

async fn run_stages(state: &Arc<AppState>, job: PipelineJob) -> Result<(), DbError> {
    let id = &job.transcript_id;

    // Cancellation window: before any work starts.
    if state.take_cancel(id) {
        let db = state.db();
        db.fail(id, CANCELLED_DETAIL)?;
        return Ok(());
    }

    // ---- Extracting ----
    {
        let db = state.db();
        db.transition(id, TranscriptStatus::Extracting)?;
    }

    let text = match extract::extract_text(&job.bytes, job.declared_mime.as_deref()) {
        Ok(text) => text,
        Err(err) => {
            let db = state.db();
            db.fail(id, &format!("extraction failed ({}): {}", err.reason(), err))?;
            return Ok(());
        }
    };

    let words = extract::word_count(&text);
    {
        let db = state.db();
        db.set_content(id, &text, words)?;

        let validation = extract::validate_transcript(&text);
        if validation.confidence < CONTENT_CONFIDENCE_WARN {
            db.log_activity(
                Some(id),
                "low_content_confidence",
                Some(&validation.issues.join("; ")),
                ActivityStatus::Warning,
            )?;
        }
    }

    // ---- Resolving ----
    {
        let db = state.db();
        db.transition(id, TranscriptStatus::Resolving)?;
    }

    let identity = resolver::resolve(&job.filename, &text);
    let client_id = {
        let db = state.db();
        let client = db.find_or_create_client(
            &identity.client_name,
            &resolver::normalize_client_name(&identity.client_name),
        )?;
        db.set_identity(
            id,
            &client.id,
            identity
                .session_date
                .map(|d| d.to_string())
                .as_deref(),
            identity.confidence,
        )?;
        if identity.confidence == crate::types::Confidence::Low {
            db.log_activity(
                Some(id),
                "low_confidence_resolution",
                Some(&format!("resolved to \"{}\" from filename only", identity.client_name)),
                ActivityStatus::Warning,
            )?;
        }
        client.id
    };

    // ---- Analyzing ----
    {
        let db = state.db();
        db.transition(id, TranscriptStatus::Analyzing)?;
    }

    let cancel_id = id.clone();
    let cancel_state = state.clone();
    let cancelled = move || cancel_state.cancel_pending(&cancel_id);

    let run = state
        .orchestrator
        .analyze(&text, &identity.client_name, &cancelled)
        .await;

    // Persist the full attempt audit trail regardless of outcome.
    let mut selected_row_id: Option<String> = None;
    {
        let db = state.db();
        for attempt in &run.attempts {
            let row_id = db.record_analysis_attempt(
                id,
                &attempt.provider_name,
                attempt.attempt_number as i64,
                attempt.succeeded,
                Some(attempt.latency_ms as i64),
                attempt.normalized_payload.as_deref(),
                attempt.raw_payload.as_deref(),
                attempt.error_detail.as_deref(),
            )?;
            if attempt.succeeded {
                selected_row_id = Some(row_id);
            }
        }
    }

    let selected = match run.outcome {
        Ok(selected) => {
            let db = state.db();
            if let Some(row_id) = &selected_row_id {
                db.mark_selected(id, row_id)?;
            }
            db.log_activity(
                Some(id),
                "analysis_selected",
                Some(&format!(
                    "{} in {} ms",
                    selected.provider_name, selected.latency_ms
                )),
                ActivityStatus::Info,
            )?;
            selected
        }
        Err(AnalysisFailure::Cancelled) => {
            let db = state.db();
            db.fail(id, CANCELLED_DETAIL)?;
            return Ok(());
        }
        Err(err @ AnalysisFailure::AllProvidersFailed { .. }) => {
            let db = state.db();
            db.fail(id, &err.to_string())?;
            return Ok(());
        }
    };

    // ---- Syncing ----
    {
        let db = state.db();
        db.transition(id, TranscriptStatus::Syncing)?;
    }
    attempt_sync(state, id, &client_id, Some(&selected.normalized), &selected.provider_name)
        .await?;
    Ok(())
}

/// One sync attempt for a transcript already in Syncing. Used for the first
/// attempt at the end of processing and by the scheduler's retry sweep.
///
/// The analysis is already durable locally before this runs; sync failure
/// can only delay or downgrade, never lose work.
pub async fn attempt_sync(
    state: &Arc<AppState>,
    id: &str,
    client_id: &str,
    analysis: Option<&NormalizedAnalysis>,
    provider_name: &str,
) -> Result<(), DbError> {
    let store = match &state.store {
        Some(store) => store.clone(),
        None => {
            let db = state.db();
            db.record_sync_attempt(id, None)?;
            db.log_activity(
                Some(id),
                "sync_skipped",
                Some("document store not configured; analysis kept locally"),
                ActivityStatus::Warning,
            )?;
            db.transition(id, TranscriptStatus::CompletedWithSyncError)?;
            return Ok(());
        }
    };

    let (client, record) = {
        let db = state.db();
        let client = db
            .get_client(client_id)?
            .ok_or_else(|| DbError::ClientNotFound(client_id.to_string()))?;
        let transcript = db
            .get_transcript(id)?
            .ok_or_else(|| DbError::TranscriptNotFound(id.to_string()))?;
        let analysis = match analysis {
            Some(a) => a.clone(),
            None => load_selected_analysis(&db, id)?,
        };
        let record = SessionRecord {
            transcript_id: id.to_string(),
            client_name: client.display_name.clone(),
            session_date: transcript.session_date.clone(),
            provider_name: provider_name.to_string(),
            analysis,
        };
        (client, record)
    };

    let result = sync_record(state, &store, &client, &record).await;

    let db = state.db();
    match result {
        Ok(()) => {
            db.record_sync_attempt(id, None)?;
            db.log_activity(Some(id), "synced", None, ActivityStatus::Success)?;
            db.transition(id, TranscriptStatus::Completed)?;
        }
        Err(err) => {
            let attempts = db.record_sync_attempt(id, None)?;
            let max = state.config.sync.max_attempts as i64;
            if attempts >= max {
                db.log_activity(
                    Some(id),
                    "sync_exhausted",
                    Some(&format!("{} after {} attempts", err, attempts)),
                    ActivityStatus::Warning,
                )?;
                db.transition(id, TranscriptStatus::CompletedWithSyncError)?;
            } else {
                let backoff_secs = state.config.sync.backoff_base_secs
                    * 2u64.saturating_pow((attempts as u32).saturating_sub(1));
                let next = Utc::now() + ChronoDuration::seconds(backoff_secs as i64);
                db.schedule_sync_retry(id, &next.to_rfc3339())?;
                db.log_activity(
                    Some(id),
                    "sync_deferred",
                    Some(&format!("attempt {}/{} failed: {}", attempts, max, err)),
                    ActivityStatus::Warning,
                )?;
                // Stays in Syncing; the scheduler sweep picks it up.
                db.transition(id, TranscriptStatus::Syncing)?;
            }
        }
    }
    Ok(())
}

/// Container-then-record write order: the container ref is persisted on the
/// client before any record lands in it, so a crash cannot orphan records.
async fn sync_record(
    state: &Arc<AppState>,
    store: &Arc<dyn crate::store::DocumentStore>,
    client: &crate::db::DbClient,
    record: &SessionRecord,
) -> Result<(), StoreError> {
    let container_ref = match &client.store_container_ref {
        Some(existing) => existing.clone(),
        None => {
            let created = store.ensure_container(&client.display_name).await?;
            {
                let db = state.db();
                db.set_client_container(&client.id, &created)
                    .map_err(|e| StoreError::MalformedResponse(e.to_string()))?;
            }
            created
        }
    };

    store.upsert_record(&container_ref, record).await
}

fn load_selected_analysis(
    db: &crate::db::PipelineDb,
    id: &str,
) -> Result<NormalizedAnalysis, DbError> {
    let selected = db
        .selected_analysis(id)?
        .ok_or_else(|| DbError::AnalysisNotFound(id.to_string()))?;
    let payload = selected.normalized_payload.unwrap_or_default();
    Ok(serde_json::from_str(&payload).unwrap_or_default())
}

/// Re-run sync for a transcript whose retry deadline passed.
pub async fn resume_sync(state: &Arc<AppState>, id: &str) -> Result<(), DbError> {
    let (client_id, provider_name) = {
        let db = state.db();
        let transcript = db
            .get_transcript(id)?
            .ok_or_else(|| DbError::TranscriptNotFound(id.to_string()))?;
        if transcript.status != TranscriptStatus::Syncing {
            return Ok(());
        }
        let client_id = transcript
            .client_id
            .ok_or_else(|| DbError::ClientNotFound(format!("no client recorded for {}", id)))?;
        let provider = db
            .selected_analysis(id)?
            .map(|a| a.provider_name)
            .unwrap_or_default();
        (client_id, provider)
    };

    attempt_sync(state, id, &client_id, None, &provider_name).await
}
