//! Ingestion scheduler.
//!
//! Periodically scans the file source for new documents and feeds them into
//! the pipeline, and sweeps transcripts stuck in Syncing whose retry
//! deadline has passed. Manual submission and the scan share the same dedup
//! path, so a document an operator already submitted by hand is skipped by
//! the next scan.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::SubmitOutcome;
use crate::pipeline::{self, Pipeline, PipelineError};
use crate::state::AppState;

/// What one scan pass did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub discovered: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub errors: usize,
}

pub struct Scheduler {
    state: Arc<AppState>,
    pipeline: Arc<Pipeline>,
    /// Mtime high-water mark; files older than this were seen by a prior
    /// scan. Dedup still catches renames and re-copies.
    last_scan: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            state,
            pipeline,
            last_scan: Mutex::new(None),
        }
    }

    /// Run the scan + sweep loop until the process exits.
    pub async fn run(self: Arc<Self>) {
        let interval_secs = self.state.config.scan_interval_secs.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.scan_once().await {
                Ok(summary) if summary.discovered > 0 => {
                    log::info!(
                        "scan: {} discovered, {} enqueued, {} duplicates, {} errors",
                        summary.discovered,
                        summary.enqueued,
                        summary.duplicates,
                        summary.errors
                    );
                }
                Ok(_) => {}
                Err(e) => log::warn!("scan failed: {}", e),
            }

            match self.sync_sweep().await {
                Ok(0) => {}
                Ok(n) => log::info!("sync sweep retried {} transcript(s)", n),
                Err(e) => log::warn!("sync sweep failed: {}", e),
            }
        }
    }

    /// One scan of the file source.
    pub async fn scan_once(&self) -> Result<ScanSummary, PipelineError> {
        let since = self.last_scan.lock().map(|g| *g).unwrap_or(None);
        let documents = self.state.source.list_new(since).await?;

        let mut summary = ScanSummary {
            discovered: documents.len(),
            ..Default::default()
        };
        let mut newest = since;
        // Documents arrive oldest first. The watermark only advances past
        // documents actually handled; once one errors it freezes, so the
        // failed document is listed again next scan and dedup skips the
        // ones already ingested.
        let mut advance = true;

        for document in documents {
            let bytes = match self.state.source.fetch(&document.filename).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("fetch {} failed: {}", document.filename, e);
                    summary.errors += 1;
                    advance = false;
                    continue;
                }
            };

            match self
                .pipeline
                .submit(&document.filename, bytes, document.declared_mime)
                .await
            {
                Ok(SubmitOutcome::New(_)) => summary.enqueued += 1,
                Ok(_) => summary.duplicates += 1,
                Err(e) => {
                    log::warn!("submit {} failed: {}", document.filename, e);
                    summary.errors += 1;
                    advance = false;
                    continue;
                }
            }

            if advance && newest.map_or(true, |n| document.modified_at > n) {
                newest = Some(document.modified_at);
            }
        }

        if let Ok(mut guard) = self.last_scan.lock() {
            *guard = newest;
        }
        Ok(summary)
    }

    /// Retry every Syncing transcript whose backoff deadline has passed.
    pub async fn sync_sweep(&self) -> Result<usize, crate::db::DbError> {
        let due = {
            let db = self.state.db();
            db.due_sync_retries(&Utc::now().to_rfc3339())?
        };

        let mut retried = 0;
        for transcript in due {
            if let Err(e) = pipeline::resume_sync(&self.state, &transcript.id).await {
                log::warn!("sync retry for {} failed: {}", transcript.id, e);
            } else {
                retried += 1;
            }
        }
        Ok(retried)
    }
}
