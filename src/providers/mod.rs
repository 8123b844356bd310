//! AI provider adapters.
//!
//! Each adapter speaks one vendor API and projects the vendor's response
//! shape into the canonical [`NormalizedAnalysis`]. Adapters make exactly
//! one HTTP call per `analyze` invocation; retries, timeouts, and fallback
//! across providers belong to the orchestrator so every attempt lands in
//! the audit trail.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{ProviderConfig, ProviderKind};
use crate::types::{NormalizedAnalysis, StructuredNote};

/// Prompt text cap. Long transcripts are truncated before being sent so a
/// single oversized session cannot blow the provider's context window.
const MAX_PROMPT_CHARS: usize = 60_000;

/// Errors from a single provider attempt.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed provider output: {0}")]
    MalformedResponse(String),

    #[error("API key not set: {0}")]
    NoApiKey(String),
}

impl ProviderError {
    /// Whether the orchestrator should retry this provider before falling
    /// through to the next one. Auth failures, client errors, and garbage
    /// output will not get better on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status == 408 || *status >= 500,
            Self::Auth(_) | Self::MalformedResponse(_) | Self::NoApiKey(_) => false,
        }
    }

    /// Stable short tag for logs and the audit column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::RateLimited => "rate_limited",
            Self::Auth(_) => "auth",
            Self::Api { .. } => "api_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::NoApiKey(_) => "no_api_key",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// One successful provider response: the canonical projection plus the raw
/// vendor payload kept for audit.
#[derive(Debug, Clone)]
pub struct ProviderAnalysis {
    pub normalized: NormalizedAnalysis,
    pub raw: serde_json::Value,
}

/// A clinical-analysis backend.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Analyze one transcript. A single attempt; no internal retry.
    async fn analyze(
        &self,
        text: &str,
        client_name: &str,
    ) -> Result<ProviderAnalysis, ProviderError>;
}

/// Instantiate the adapter for one provider config entry.
///
/// Fails with `NoApiKey` when the configured environment variable is unset,
/// so startup can log and skip that provider rather than failing every
/// transcript against it.
pub fn build_provider(
    config: &ProviderConfig,
    prompt_profile: &str,
) -> Result<Box<dyn AnalysisProvider>, ProviderError> {
    let api_key = std::env::var(&config.api_key_env)
        .map_err(|_| ProviderError::NoApiKey(config.api_key_env.clone()))?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout_secs))
        .build()?;

    let profile = prompt_profile.to_string();
    Ok(match config.kind {
        ProviderKind::OpenAi => Box::new(
            openai::OpenAiProvider::new(
                config.name.clone(),
                config.model.clone(),
                api_key,
                client,
            )
            .with_prompt_profile(profile),
        ),
        ProviderKind::Anthropic => Box::new(
            anthropic::AnthropicProvider::new(
                config.name.clone(),
                config.model.clone(),
                api_key,
                client,
            )
            .with_prompt_profile(profile),
        ),
        ProviderKind::Gemini => Box::new(
            gemini::GeminiProvider::new(
                config.name.clone(),
                config.model.clone(),
                api_key,
                client,
            )
            .with_prompt_profile(profile),
        ),
    })
}

/// Assemble the analysis prompt for one transcript.
pub fn build_prompt(profile: &str, client_name: &str, text: &str) -> String {
    let body = if text.len() > MAX_PROMPT_CHARS {
        let mut end = MAX_PROMPT_CHARS;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    } else {
        text
    };
    format!("{}(Client: {})\n{}", profile, client_name, body)
}

/// Map a non-success HTTP response to a `ProviderError`.
pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    let message: String = message.chars().take(500).collect();

    match status.as_u16() {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::RateLimited,
        code => ProviderError::Api {
            status: code,
            message,
        },
    }
}

/// Flat JSON shape the clinical prompt asks every model to produce.
#[derive(Debug, Default, Deserialize)]
struct ModelPayload {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "keyThemes")]
    key_themes: Vec<String>,
    #[serde(default, alias = "sentimentScore")]
    sentiment_score: Option<f64>,
    #[serde(default)]
    subjective: Option<String>,
    #[serde(default)]
    objective: Option<String>,
    #[serde(default)]
    assessment: Option<String>,
    #[serde(default)]
    plan: Option<String>,
}

/// Parse model output text into the canonical analysis.
///
/// Tolerates markdown code fences and leading/trailing prose around the JSON
/// object. Absent fields stay `None`; nothing is fabricated. Sentiment is
/// clamped to the 0-10 scale the prompt specifies.
pub fn parse_model_json(content: &str) -> Result<NormalizedAnalysis, ProviderError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => {
            return Err(ProviderError::MalformedResponse(
                "no JSON object in model output".to_string(),
            ))
        }
    };

    let payload: ModelPayload = serde_json::from_str(json)
        .map_err(|e| ProviderError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    Ok(NormalizedAnalysis {
        summary: non_empty(payload.summary),
        key_themes: payload
            .key_themes
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        sentiment_score: payload.sentiment_score.map(|s| s.clamp(0.0, 10.0)),
        structured_note: StructuredNote {
            subjective: non_empty(payload.subjective),
            objective: non_empty(payload.objective),
            assessment: non_empty(payload.assessment),
            plan: non_empty(payload.plan),
        },
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let t = s.trim().to_string();
        (!t.is_empty()).then_some(t)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let analysis = parse_model_json(
            r#"{"summary": "Discussed grief.", "key_themes": ["grief", "sleep"],
                "sentiment_score": 3.5, "subjective": "Reports sadness.",
                "plan": "Weekly sessions."}"#,
        )
        .unwrap();
        assert_eq!(analysis.summary.as_deref(), Some("Discussed grief."));
        assert_eq!(analysis.key_themes, vec!["grief", "sleep"]);
        assert_eq!(analysis.sentiment_score, Some(3.5));
        assert_eq!(
            analysis.structured_note.subjective.as_deref(),
            Some("Reports sadness.")
        );
        assert!(analysis.structured_note.objective.is_none());
    }

    #[test]
    fn test_parse_fenced_json() {
        let analysis = parse_model_json(
            "Here is the analysis:\n```json\n{\"summary\": \"ok\"}\n```\nDone.",
        )
        .unwrap();
        assert_eq!(analysis.summary.as_deref(), Some("ok"));
    }

    #[test]
    fn test_parse_absent_fields_stay_none() {
        let analysis = parse_model_json("{}").unwrap();
        assert!(analysis.summary.is_none());
        assert!(analysis.key_themes.is_empty());
        assert!(analysis.sentiment_score.is_none());
        assert!(analysis.structured_note.is_empty());
    }

    #[test]
    fn test_parse_clamps_sentiment_and_drops_blank_strings() {
        let analysis = parse_model_json(
            r#"{"sentiment_score": 14.2, "summary": "   ", "key_themes": [" ", "anxiety "]}"#,
        )
        .unwrap();
        assert_eq!(analysis.sentiment_score, Some(10.0));
        assert!(analysis.summary.is_none());
        assert_eq!(analysis.key_themes, vec!["anxiety"]);
    }

    #[test]
    fn test_parse_no_json_is_malformed() {
        let err = parse_model_json("I cannot analyze this transcript.").unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "malformed_response");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(ProviderError::Api { status: 408, message: String::new() }.is_retryable());

        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
        assert!(!ProviderError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!ProviderError::NoApiKey("OPENAI_API_KEY".into()).is_retryable());
    }

    #[test]
    fn test_build_prompt_truncates_on_char_boundary() {
        let text = "é".repeat(MAX_PROMPT_CHARS);
        let prompt = build_prompt("Analyze:\n", "Jordan", &text);
        assert!(prompt.len() < text.len() + 64);
        assert!(prompt.starts_with("Analyze:\n(Client: Jordan)"));
    }
}
