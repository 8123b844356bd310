//! External document store sync.
//!
//! One container per client, one record per transcript. Records are keyed
//! by transcript id so re-running a sync updates in place instead of
//! duplicating.

pub mod notion;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NormalizedAnalysis;

/// Errors from document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Store not configured: {0}")]
    NotConfigured(String),

    #[error("Malformed store response: {0}")]
    MalformedResponse(String),
}

/// The payload synced for one completed analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub transcript_id: String,
    pub client_name: String,
    pub session_date: Option<String>,
    pub provider_name: String,
    pub analysis: NormalizedAnalysis,
}

/// A per-client store of session records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Find or create the client's container. Returns a stable reference
    /// that is persisted locally before any record write.
    async fn ensure_container(&self, client_name: &str) -> Result<String, StoreError>;

    /// Create or update the record for one transcript. Idempotent on the
    /// transcript id.
    async fn upsert_record(
        &self,
        container_ref: &str,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;
}
