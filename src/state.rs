//! Shared application state.
//!
//! One `AppState` owns the configuration, the SQLite handle, the document
//! source and store, and the analysis orchestrator. The database sits
//! behind a `std::sync::Mutex`; guards are never held across an await.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::config::Config;
use crate::db::{DbError, PipelineDb};
use crate::orchestrator::{Orchestrator, ProviderSlot};
use crate::providers::{build_provider, ProviderError};
use crate::source::{DropFolderSource, FileSource};
use crate::store::notion::NotionStore;
use crate::store::{DocumentStore, StoreError};
use crate::types::TranscriptStatus;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Database: {0}")]
    Db(#[from] DbError),

    #[error("No usable providers: {0}")]
    NoProviders(String),
}

pub struct AppState {
    pub config: Config,
    pub db: Mutex<PipelineDb>,
    pub source: Arc<dyn FileSource>,
    /// Absent when the store is not configured; transcripts then settle as
    /// CompletedWithSyncError with their analysis kept locally.
    pub store: Option<Arc<dyn DocumentStore>>,
    pub orchestrator: Orchestrator,
    /// Transcript ids with a pending operator cancellation.
    pub cancel_requested: Mutex<HashSet<String>>,
}

impl AppState {
    /// Production wiring from config: open the database, build the drop
    /// folder source, the store (if configured), and every provider whose
    /// API key is present.
    pub fn from_config(config: Config) -> Result<Self, StateError> {
        let db = match &config.db_path {
            Some(path) => PipelineDb::open_at(PathBuf::from(path))?,
            None => PipelineDb::open()?,
        };

        let source: Arc<dyn FileSource> = Arc::new(DropFolderSource::new(
            PathBuf::from(&config.watch_folder),
            config.max_file_size_bytes(),
        ));

        let store: Option<Arc<dyn DocumentStore>> = match NotionStore::from_config(&config.sync)
        {
            Ok(store) => Some(Arc::new(store)),
            Err(StoreError::NotConfigured(reason)) => {
                log::warn!("document store disabled: {}", reason);
                None
            }
            Err(e) => {
                log::warn!("document store unavailable: {}", e);
                None
            }
        };

        let mut slots = Vec::new();
        let mut skipped = Vec::new();
        for provider_config in &config.providers {
            match build_provider(provider_config, config.prompt()) {
                Ok(provider) => {
                    slots.push(ProviderSlot::new(Arc::from(provider), provider_config));
                }
                Err(ProviderError::NoApiKey(env)) => {
                    log::warn!(
                        "provider {} disabled: {} not set",
                        provider_config.name,
                        env
                    );
                    skipped.push(provider_config.name.clone());
                }
                Err(e) => {
                    log::warn!("provider {} disabled: {}", provider_config.name, e);
                    skipped.push(provider_config.name.clone());
                }
            }
        }
        if slots.is_empty() {
            return Err(StateError::NoProviders(format!(
                "all configured providers unavailable: {}",
                skipped.join(", ")
            )));
        }

        let orchestrator = Orchestrator::new(slots, config.retry.clone());
        Ok(Self::with_parts(config, db, source, store, orchestrator))
    }

    /// Assemble from explicit parts. Test entry point.
    pub fn with_parts(
        config: Config,
        db: PipelineDb,
        source: Arc<dyn FileSource>,
        store: Option<Arc<dyn DocumentStore>>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            config,
            db: Mutex::new(db),
            source,
            store,
            orchestrator,
            cancel_requested: Mutex::new(HashSet::new()),
        }
    }

    /// Lock the database, recovering from a poisoned lock.
    pub fn db(&self) -> MutexGuard<'_, PipelineDb> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an operator cancellation. Accepted only while the transcript
    /// has processing left to skip; once it reaches Syncing the analysis is
    /// already paid for and sync runs to its own conclusion.
    pub fn request_cancel(&self, id: &str) -> Result<bool, DbError> {
        let status = {
            let db = self.db();
            db.get_transcript(id)?
                .ok_or_else(|| DbError::TranscriptNotFound(id.to_string()))?
                .status
        };

        let cancellable = matches!(
            status,
            TranscriptStatus::Pending
                | TranscriptStatus::Extracting
                | TranscriptStatus::Resolving
                | TranscriptStatus::Analyzing
        );
        if cancellable {
            if let Ok(mut set) = self.cancel_requested.lock() {
                set.insert(id.to_string());
            }
        }
        Ok(cancellable)
    }

    /// Whether a cancellation is pending, without consuming it.
    pub fn cancel_pending(&self, id: &str) -> bool {
        self.cancel_requested
            .lock()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    /// Consume a pending cancellation.
    pub fn take_cancel(&self, id: &str) -> bool {
        self.cancel_requested
            .lock()
            .map(|mut set| set.remove(id))
            .unwrap_or(false)
    }
}
