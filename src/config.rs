//! Configuration loading for the pipeline.
//!
//! All tunables the pipeline depends on — provider priority order, retry
//! counts, timeouts, sync retry threshold, worker count — live here with
//! serde defaults, so tests can construct a `Config` directly and operators
//! can override any subset in `~/.sessionflow/config.json`.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default clinical analysis prompt. Asks for a strict JSON payload so every
/// provider can be projected into the canonical schema. Condensed SOAP-note
/// structure; the full profile is operator-overridable via `promptProfile`.
pub const DEFAULT_PROMPT_PROFILE: &str = "You are an experienced clinical therapist writing \
a session progress note. Analyze the counseling session transcript below and respond with \
a single JSON object, no markdown, with exactly these keys: \
\"summary\" (2-4 sentence session summary), \
\"key_themes\" (array of short theme strings), \
\"sentiment_score\" (number 0-10, overall client sentiment), \
\"subjective\" (client-reported experiences and concerns), \
\"objective\" (observed affect, behavior, engagement), \
\"assessment\" (clinical assessment integrating the above), \
\"plan\" (interventions and follow-up). \
Omit any key you cannot ground in the transcript.\n\nTranscript:\n";

/// Which provider API shape an entry speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

/// One configured AI provider. Order in `Config::providers` is the fallback
/// priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    /// Environment variable holding the API key. The key itself never lives
    /// in the config file.
    pub api_key_env: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Global in-flight request cap for this provider, independent of the
    /// worker pool size.
    #[serde(default = "default_provider_concurrency")]
    pub max_concurrency: usize,
}

fn default_provider_timeout_secs() -> u64 {
    90
}

fn default_provider_concurrency() -> usize {
    2
}

/// Per-attempt retry policy for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts per provider before falling through to the next one.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// External document store sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Sync attempts before a transcript settles as CompletedWithSyncError.
    #[serde(default = "default_sync_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff between sync attempts.
    #[serde(default = "default_sync_backoff_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_store_token_env")]
    pub token_env: String,
    /// Parent page under which per-client containers are created.
    #[serde(default)]
    pub parent_page_id: String,
}

fn default_sync_attempts() -> u32 {
    3
}

fn default_sync_backoff_secs() -> u64 {
    60
}

fn default_store_token_env() -> String {
    "NOTION_INTEGRATION_SECRET".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_sync_attempts(),
            backoff_base_secs: default_sync_backoff_secs(),
            token_env: default_store_token_env(),
            parent_page_id: String::new(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Folder scanned for new transcript documents.
    #[serde(default)]
    pub watch_folder: String,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Overrides the built-in clinical prompt when set.
    #[serde(default)]
    pub prompt_profile: Option<String>,
    /// Overrides the default `~/.sessionflow/sessions.db` path.
    #[serde(default)]
    pub db_path: Option<String>,
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_worker_count() -> usize {
    2
}

fn default_max_file_size_mb() -> u64 {
    50
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: default_provider_timeout_secs(),
            max_concurrency: default_provider_concurrency(),
        },
        ProviderConfig {
            name: "anthropic".to_string(),
            kind: ProviderKind::Anthropic,
            model: "claude-3-5-sonnet-20241022".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            timeout_secs: default_provider_timeout_secs(),
            max_concurrency: default_provider_concurrency(),
        },
        ProviderConfig {
            name: "gemini".to_string(),
            kind: ProviderKind::Gemini,
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: default_provider_timeout_secs(),
            max_concurrency: default_provider_concurrency(),
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via defaults")
    }
}

impl Config {
    pub fn prompt(&self) -> &str {
        self.prompt_profile.as_deref().unwrap_or(DEFAULT_PROMPT_PROFILE)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Get the canonical config file path (~/.sessionflow/config.json).
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".sessionflow").join("config.json"))
}

/// Load configuration from ~/.sessionflow/config.json.
///
/// Returns defaults when the file does not exist; any present file must
/// parse, so a typo fails loudly rather than silently reverting a tunable.
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;

    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content =
        fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_three_providers_in_order() {
        let config = Config::default();
        let names: Vec<&str> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["openai", "anthropic", "gemini"]);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.scan_interval_secs, 300);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.max_file_size_mb, 50);
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "watchFolder": "/data/transcripts",
                "workerCount": 4,
                "sync": { "maxAttempts": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.watch_folder, "/data/transcripts");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.backoff_base_secs, 60);
        assert_eq!(config.scan_interval_secs, 300);
    }

    #[test]
    fn test_provider_order_is_priority_order() {
        let config: Config = serde_json::from_str(
            r#"{
                "providers": [
                    {"name": "claude", "kind": "anthropic", "model": "claude-3-5-sonnet-20241022", "apiKeyEnv": "ANTHROPIC_API_KEY"},
                    {"name": "gpt", "kind": "openai", "model": "gpt-4o", "apiKeyEnv": "OPENAI_API_KEY"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name, "claude");
        assert_eq!(config.providers[0].kind, ProviderKind::Anthropic);
        assert_eq!(config.providers[0].timeout_secs, 90);
        assert_eq!(config.providers[1].max_concurrency, 2);
    }

    #[test]
    fn test_prompt_override() {
        let mut config = Config::default();
        assert!(config.prompt().starts_with("You are an experienced clinical therapist"));
        config.prompt_profile = Some("Custom prompt:".to_string());
        assert_eq!(config.prompt(), "Custom prompt:");
    }
}
