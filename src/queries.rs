//! Read-only query surface for operators.
//!
//! Serializable DTO builders over the database; no business logic. These
//! are what a dashboard or CLI shows, so the distinctions an operator acts
//! on have to be visible here: `Failed` means lost work and is retryable,
//! `Syncing` and `CompletedWithSyncError` mean the analysis is safe locally
//! and only the external copy is behind.

use serde::Serialize;

use crate::db::{DbActivity, DbAnalysisResult, DbError, DbTranscript, StatusCounts};
use crate::state::AppState;
use crate::types::TranscriptStatus;

/// Everything known about one transcript.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptOverview {
    pub transcript: DbTranscript,
    pub client_name: Option<String>,
    /// Whether the operator can retry this transcript right now.
    pub retryable: bool,
    /// Whether the analysis exists locally despite an unsynced or
    /// degraded external copy.
    pub analysis_preserved: bool,
    pub attempts: Vec<DbAnalysisResult>,
    pub activity: Vec<DbActivity>,
}

/// One row of a client's session history.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSession {
    pub transcript_id: String,
    pub session_date: Option<String>,
    pub status: TranscriptStatus,
    pub summary: Option<String>,
    pub provider_name: Option<String>,
}

/// Pipeline-wide counts, derived fresh on every call.
pub fn status_counts(state: &AppState) -> Result<StatusCounts, DbError> {
    let db = state.db();
    db.status_counts()
}

/// Recent activity-log entries, newest first.
pub fn recent_activity(state: &AppState, limit: i64) -> Result<Vec<DbActivity>, DbError> {
    let db = state.db();
    db.recent_activity(limit)
}

/// Full detail for one transcript, or None if unknown.
pub fn transcript_overview(
    state: &AppState,
    id: &str,
) -> Result<Option<TranscriptOverview>, DbError> {
    let db = state.db();
    let Some(transcript) = db.get_transcript(id)? else {
        return Ok(None);
    };

    let client_name = match &transcript.client_id {
        Some(client_id) => db.get_client(client_id)?.map(|c| c.display_name),
        None => None,
    };
    let attempts = db.analysis_attempts(id)?;
    let activity = db.transcript_activity(id)?;

    let analysis_preserved = attempts.iter().any(|a| a.selected);
    Ok(Some(TranscriptOverview {
        retryable: transcript.status == TranscriptStatus::Failed,
        analysis_preserved,
        transcript,
        client_name,
        attempts,
        activity,
    }))
}

/// A client's sessions, most recent first, each with its selected summary.
pub fn client_sessions(state: &AppState, client_id: &str) -> Result<Vec<ClientSession>, DbError> {
    let db = state.db();
    let transcripts = db.client_sessions(client_id)?;

    let mut sessions = Vec::with_capacity(transcripts.len());
    for transcript in transcripts {
        let selected = db.selected_analysis(&transcript.id)?;
        let summary = selected.as_ref().and_then(|s| {
            s.normalized_payload
                .as_deref()
                .and_then(|p| serde_json::from_str::<crate::types::NormalizedAnalysis>(p).ok())
                .and_then(|n| n.summary)
        });
        sessions.push(ClientSession {
            transcript_id: transcript.id,
            session_date: transcript.session_date,
            status: transcript.status,
            summary,
            provider_name: selected.map(|s| s.provider_name),
        });
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::orchestrator::Orchestrator;
    use crate::source::{FileSource, SourceDocument, SourceError};
    use crate::types::Confidence;

    use async_trait::async_trait;

    struct NullSource;

    #[async_trait]
    impl FileSource for NullSource {
        async fn list_new(
            &self,
            _since: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<Vec<SourceDocument>, SourceError> {
            Ok(Vec::new())
        }

        async fn fetch(&self, filename: &str) -> Result<Vec<u8>, SourceError> {
            Err(SourceError::NotFound(filename.to_string()))
        }
    }

    fn test_state() -> AppState {
        let config = Config::default();
        let retry = config.retry.clone();
        AppState::with_parts(
            config,
            crate::db::tests::test_db(),
            Arc::new(NullSource),
            None,
            Orchestrator::new(Vec::new(), retry),
        )
    }

    fn seed_transcript(state: &AppState, filename: &str, hash: &str) -> String {
        let db = state.db();
        match db.submit_or_skip(filename, hash, None).expect("submit") {
            crate::db::SubmitOutcome::New(id) => id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overview_distinguishes_failed_from_sync_error() {
        let state = test_state();
        let failed = seed_transcript(&state, "failed.txt", "h1");
        let degraded = seed_transcript(&state, "degraded.txt", "h2");

        {
            let db = state.db();
            db.transition(&failed, TranscriptStatus::Extracting).unwrap();
            db.fail(&failed, "all providers failed").unwrap();

            for step in [
                TranscriptStatus::Extracting,
                TranscriptStatus::Resolving,
                TranscriptStatus::Analyzing,
            ] {
                db.transition(&degraded, step).unwrap();
            }
            let row = db
                .record_analysis_attempt(
                    &degraded,
                    "openai",
                    1,
                    true,
                    Some(500),
                    Some(r#"{"summary":"kept"}"#),
                    None,
                    None,
                )
                .unwrap();
            db.mark_selected(&degraded, &row).unwrap();
            db.transition(&degraded, TranscriptStatus::Syncing).unwrap();
            db.transition(&degraded, TranscriptStatus::CompletedWithSyncError)
                .unwrap();
        }

        let failed_view = transcript_overview(&state, &failed).unwrap().unwrap();
        assert!(failed_view.retryable);
        assert!(!failed_view.analysis_preserved);

        let degraded_view = transcript_overview(&state, &degraded).unwrap().unwrap();
        assert!(!degraded_view.retryable);
        assert!(degraded_view.analysis_preserved);
        assert!(!degraded_view.activity.is_empty());
    }

    #[test]
    fn test_overview_activity_not_crowded_out_of_busy_log() {
        let state = test_state();
        let id = seed_transcript(&state, "old.txt", "h1");

        {
            let db = state.db();
            db.transition(&id, crate::types::TranscriptStatus::Extracting)
                .unwrap();
            db.fail(&id, "corrupt").unwrap();
            // Plenty of later traffic from other transcripts.
            for n in 0..300 {
                db.log_activity(None, "scan_noise", Some(&n.to_string()), crate::types::ActivityStatus::Info)
                    .unwrap();
            }
        }

        let view = transcript_overview(&state, &id).unwrap().unwrap();
        let events: Vec<&str> = view.activity.iter().map(|a| a.event.as_str()).collect();
        assert!(events.contains(&"received"));
        assert!(events.contains(&"failed"));
        // Oldest first: submission precedes failure.
        assert_eq!(events.first(), Some(&"received"));
    }

    #[test]
    fn test_overview_unknown_id_is_none() {
        let state = test_state();
        assert!(transcript_overview(&state, "missing").unwrap().is_none());
    }

    #[test]
    fn test_client_sessions_carry_summaries() {
        let state = test_state();
        let id = seed_transcript(&state, "a.txt", "h1");

        let client_id = {
            let db = state.db();
            let client = db.find_or_create_client("Jordan Lee", "jordan lee").unwrap();
            db.set_identity(&id, &client.id, Some("2024-03-11"), Confidence::High)
                .unwrap();
            let row = db
                .record_analysis_attempt(
                    &id,
                    "anthropic",
                    1,
                    true,
                    Some(400),
                    Some(r#"{"summary":"Discussed progress."}"#),
                    None,
                    None,
                )
                .unwrap();
            db.mark_selected(&id, &row).unwrap();
            client.id
        };

        let sessions = client_sessions(&state, &client_id).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].summary.as_deref(), Some("Discussed progress."));
        assert_eq!(sessions[0].provider_name.as_deref(), Some("anthropic"));
        assert_eq!(sessions[0].session_date.as_deref(), Some("2024-03-11"));
    }

    #[test]
    fn test_status_counts_passthrough() {
        let state = test_state();
        seed_transcript(&state, "a.txt", "h1");
        seed_transcript(&state, "b.txt", "h2");

        let counts = status_counts(&state).unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.pending, 2);
    }
}
