//! Core domain types shared across the pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a transcript.
///
/// Forward-only: Pending → Extracting → Resolving → Analyzing → Syncing →
/// Completed. `Failed` is reachable from Extracting and Analyzing;
/// `CompletedWithSyncError` from Syncing once sync retries are exhausted.
/// Syncing may self-transition (bounded retry). The only backward edge is
/// the operator-triggered Failed → Pending retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    Pending,
    Extracting,
    Resolving,
    Analyzing,
    Syncing,
    Completed,
    CompletedWithSyncError,
    Failed,
}

impl TranscriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Resolving => "resolving",
            Self::Analyzing => "analyzing",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::CompletedWithSyncError => "completed_with_sync_error",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "extracting" => Some(Self::Extracting),
            "resolving" => Some(Self::Resolving),
            "analyzing" => Some(Self::Analyzing),
            "syncing" => Some(Self::Syncing),
            "completed" => Some(Self::Completed),
            "completed_with_sync_error" => Some(Self::CompletedWithSyncError),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states receive no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithSyncError | Self::Failed
        )
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(&self, to: TranscriptStatus) -> bool {
        use TranscriptStatus::*;
        matches!(
            (self, to),
            (Pending, Extracting)
                | (Extracting, Resolving)
                | (Resolving, Analyzing)
                | (Analyzing, Syncing)
                | (Syncing, Syncing)
                | (Syncing, Completed)
                | (Syncing, CompletedWithSyncError)
                | (Pending, Failed)
                | (Extracting, Failed)
                | (Resolving, Failed)
                | (Analyzing, Failed)
                // Operator-triggered retry only; never automatic.
                | (Failed, Pending)
        )
    }
}

/// How confident the resolver is in the client identity it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Output of the client/session resolver. Never empty: worst case is the
/// filename stem at low confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIdentity {
    pub client_name: String,
    pub session_date: Option<NaiveDate>,
    pub confidence: Confidence,
}

/// SOAP-style sections of a clinical progress note. Providers that do not
/// return a given section leave it `None`; sections are never fabricated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

impl StructuredNote {
    pub fn is_empty(&self) -> bool {
        self.subjective.is_none()
            && self.objective.is_none()
            && self.assessment.is_none()
            && self.plan.is_none()
    }
}

/// Canonical analysis payload. Every provider adapter projects its own
/// response shape into this schema so downstream persistence and sync are
/// provider-agnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_themes: Vec<String>,
    /// Session sentiment on a 0-10 scale, as scored by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub structured_note: StructuredNote,
}

/// The analysis chosen for a transcript: the first provider in priority
/// order that succeeded.
#[derive(Debug, Clone)]
pub struct SelectedAnalysis {
    pub provider_name: String,
    pub normalized: NormalizedAnalysis,
    pub latency_ms: u64,
}

/// Severity of an activity-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Warning,
    Error,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TranscriptStatus::Pending,
            TranscriptStatus::Extracting,
            TranscriptStatus::Resolving,
            TranscriptStatus::Analyzing,
            TranscriptStatus::Syncing,
            TranscriptStatus::Completed,
            TranscriptStatus::CompletedWithSyncError,
            TranscriptStatus::Failed,
        ] {
            assert_eq!(TranscriptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TranscriptStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TranscriptStatus::Completed.is_terminal());
        assert!(TranscriptStatus::CompletedWithSyncError.is_terminal());
        assert!(TranscriptStatus::Failed.is_terminal());
        assert!(!TranscriptStatus::Syncing.is_terminal());
        assert!(!TranscriptStatus::Pending.is_terminal());
    }

    #[test]
    fn test_forward_transitions() {
        use TranscriptStatus::*;
        assert!(Pending.can_transition_to(Extracting));
        assert!(Extracting.can_transition_to(Resolving));
        assert!(Resolving.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Completed));
    }

    #[test]
    fn test_no_skipping_stages() {
        use TranscriptStatus::*;
        assert!(!Pending.can_transition_to(Analyzing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Extracting.can_transition_to(Analyzing));
        assert!(!Resolving.can_transition_to(Syncing));
    }

    #[test]
    fn test_syncing_self_transition_and_exhaustion() {
        use TranscriptStatus::*;
        assert!(Syncing.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(CompletedWithSyncError));
        // Sync exhaustion is never a plain failure: the analysis is kept.
        assert!(!Syncing.can_transition_to(Failed));
    }

    #[test]
    fn test_failed_retry_is_only_backward_edge() {
        use TranscriptStatus::*;
        assert!(Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!CompletedWithSyncError.can_transition_to(Pending));
        assert!(!Syncing.can_transition_to(Pending));
    }

    #[test]
    fn test_normalized_analysis_serde_roundtrip() {
        let analysis = NormalizedAnalysis {
            summary: Some("Client discussed workplace stress.".to_string()),
            key_themes: vec!["stress".to_string(), "boundaries".to_string()],
            sentiment_score: Some(4.5),
            structured_note: StructuredNote {
                subjective: Some("Reports poor sleep.".to_string()),
                objective: None,
                assessment: Some("Consistent with GAD presentation.".to_string()),
                plan: None,
            },
        };

        let json = serde_json::to_string(&analysis).unwrap();
        let parsed: NormalizedAnalysis = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, analysis);
    }

    #[test]
    fn test_normalized_analysis_absent_fields_stay_null() {
        let parsed: NormalizedAnalysis = serde_json::from_str("{}").unwrap();
        assert!(parsed.summary.is_none());
        assert!(parsed.key_themes.is_empty());
        assert!(parsed.sentiment_score.is_none());
        assert!(parsed.structured_note.is_empty());
    }
}
