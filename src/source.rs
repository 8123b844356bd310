//! Transcript document sources.
//!
//! The scheduler pulls new documents through the [`FileSource`] trait so
//! tests can inject in-memory sources. The production impl scans a local
//! drop folder.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// File extensions the pipeline accepts from a drop folder.
const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "txt", "text", "md"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document too large: {filename} ({size} bytes, limit {limit})")]
    TooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },
}

/// A document visible at the source, not yet fetched.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub filename: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    /// Best-effort MIME guess from the extension. Extraction sniffs the
    /// actual bytes; this is only a hint.
    pub declared_mime: Option<String>,
}

/// Somewhere transcripts come from.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Documents modified since the given cutoff, oldest first.
    async fn list_new(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceDocument>, SourceError>;

    /// Fetch a document's bytes by filename.
    async fn fetch(&self, filename: &str) -> Result<Vec<u8>, SourceError>;
}

/// Drop-folder source: a local directory operators copy transcripts into.
pub struct DropFolderSource {
    folder: PathBuf,
    max_file_size: u64,
}

impl DropFolderSource {
    pub fn new(folder: PathBuf, max_file_size: u64) -> Self {
        Self {
            folder,
            max_file_size,
        }
    }

    fn supported(filename: &str) -> bool {
        filename
            .rsplit('.')
            .next()
            .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    fn mime_for(filename: &str) -> Option<String> {
        let ext = filename.rsplit('.').next()?.to_lowercase();
        let mime = match ext.as_str() {
            "pdf" => "application/pdf",
            "docx" => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            "txt" | "text" => "text/plain",
            "md" => "text/markdown",
            _ => return None,
        };
        Some(mime.to_string())
    }
}

#[async_trait]
impl FileSource for DropFolderSource {
    async fn list_new(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceDocument>, SourceError> {
        let mut documents = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("watch folder missing: {}", self.folder.display());
                return Ok(documents);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let filename = entry.file_name().to_string_lossy().into_owned();
            // Skip dotfiles and partial copies.
            if filename.starts_with('.') || filename.ends_with(".part") {
                continue;
            }
            if !Self::supported(&filename) {
                continue;
            }

            if metadata.len() > self.max_file_size {
                log::warn!(
                    "skipping oversized document {} ({} bytes)",
                    filename,
                    metadata.len()
                );
                continue;
            }

            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            if let Some(cutoff) = since {
                if modified_at <= cutoff {
                    continue;
                }
            }

            documents.push(SourceDocument {
                declared_mime: Self::mime_for(&filename),
                filename,
                modified_at,
                size: metadata.len(),
            });
        }

        documents.sort_by_key(|d| d.modified_at);
        Ok(documents)
    }

    async fn fetch(&self, filename: &str) -> Result<Vec<u8>, SourceError> {
        // Refuse path traversal out of the drop folder.
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return Err(SourceError::NotFound(filename.to_string()));
        }

        let path = self.folder.join(filename);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(filename.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() > self.max_file_size {
            return Err(SourceError::TooLarge {
                filename: filename.to_string(),
                size: metadata.len(),
                limit: self.max_file_size,
            });
        }

        Ok(tokio::fs::read(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &std::path::Path, name: &str, contents: &[u8]) {
        fs::write(dir.join(name), contents).expect("write test file");
    }

    #[tokio::test]
    async fn test_lists_only_supported_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "jordan_2024-03-11.txt", b"Client: hello");
        write_file(dir.path(), "scan.pdf", b"%PDF-1.4");
        write_file(dir.path(), "notes.xlsx", b"nope");
        write_file(dir.path(), ".hidden.txt", b"nope");
        write_file(dir.path(), "upload.txt.part", b"nope");

        let source = DropFolderSource::new(dir.path().to_path_buf(), 1024);
        let docs = source.list_new(None).await.expect("list");
        let mut names: Vec<&str> = docs.iter().map(|d| d.filename.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["jordan_2024-03-11.txt", "scan.pdf"]);
    }

    #[tokio::test]
    async fn test_mtime_cutoff_filters_old_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "old.txt", b"old");
        write_file(dir.path(), "new.txt", b"new");

        let old_time = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(dir.path().join("old.txt"), old_time).expect("set mtime");

        let cutoff = DateTime::from_timestamp(1_700_000_000, 0);
        let source = DropFolderSource::new(dir.path().to_path_buf(), 1024);
        let docs = source.list_new(cutoff).await.expect("list");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "new.txt");
    }

    #[tokio::test]
    async fn test_oversized_files_skipped_and_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "big.txt", &vec![b'a'; 100]);

        let source = DropFolderSource::new(dir.path().to_path_buf(), 50);
        assert!(source.list_new(None).await.expect("list").is_empty());
        assert!(matches!(
            source.fetch("big.txt").await,
            Err(SourceError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = DropFolderSource::new(dir.path().to_path_buf(), 1024);
        assert!(matches!(
            source.fetch("../etc/passwd").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_roundtrip_and_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.txt", b"Therapist: hello");

        let source = DropFolderSource::new(dir.path().to_path_buf(), 1024);
        assert_eq!(source.fetch("a.txt").await.expect("fetch"), b"Therapist: hello");
        assert!(matches!(
            source.fetch("gone.txt").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_folder_lists_empty() {
        let source = DropFolderSource::new(PathBuf::from("/nonexistent/sessionflow-test"), 1024);
        assert!(source.list_new(None).await.expect("list").is_empty());
    }

    #[test]
    fn test_mime_hints() {
        assert_eq!(
            DropFolderSource::mime_for("a.PDF").as_deref(),
            Some("application/pdf")
        );
        assert_eq!(
            DropFolderSource::mime_for("a.txt").as_deref(),
            Some("text/plain")
        );
        assert!(DropFolderSource::mime_for("a.xlsx").is_none());
    }
}
