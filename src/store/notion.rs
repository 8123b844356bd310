//! Notion adapter for the document store.
//!
//! Layout: one Notion database per client, created under a configured
//! parent page, with one page per transcript. Pages are located by a
//! `Transcript ID` rich-text property filter, which is what makes
//! `upsert_record` idempotent.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{DocumentStore, SessionRecord, StoreError};
use crate::config::SyncConfig;

const API_BASE: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Notion caps rich-text property values at 2000 characters.
const MAX_RICH_TEXT: usize = 2000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn status_is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying transport errors and retryable statuses.
/// Transport-level only; the scheduler owns the slower between-sync backoff.
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, StoreError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(StoreError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if status_is_retryable(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "notion retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable = err.is_timeout() || err.is_connect();
                if retryable && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "notion retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(StoreError::Http(err));
            }
        }
    }

    Err(StoreError::MalformedResponse(
        "request exhausted retries".to_string(),
    ))
}

pub struct NotionStore {
    client: reqwest::Client,
    token: String,
    parent_page_id: String,
    retry: RetryPolicy,
}

impl NotionStore {
    /// Build from sync config. Fails with `NotConfigured` when the token env
    /// var is unset or the parent page is missing, so startup can downgrade
    /// to local-only mode.
    pub fn from_config(config: &SyncConfig) -> Result<Self, StoreError> {
        let token = std::env::var(&config.token_env)
            .map_err(|_| StoreError::NotConfigured(format!("{} not set", config.token_env)))?;
        if config.parent_page_id.is_empty() {
            return Err(StoreError::NotConfigured(
                "sync.parentPageId not set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            token,
            parent_page_id: config.parent_page_id.clone(),
            retry: RetryPolicy::default(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", API_BASE, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn expect_json(response: reqwest::Response) -> Result<Value, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StoreError::Api {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }
        Ok(response.json().await?)
    }

    /// Find the page holding this transcript's record, if any.
    async fn find_record_page(
        &self,
        container_ref: &str,
        transcript_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let body = json!({
            "filter": {
                "property": "Transcript ID",
                "rich_text": { "equals": transcript_id }
            },
            "page_size": 1
        });
        let response = send_with_retry(
            self.request(
                reqwest::Method::POST,
                &format!("/databases/{}/query", container_ref),
            )
            .json(&body),
            &self.retry,
        )
        .await?;
        let payload = Self::expect_json(response).await?;

        Ok(payload
            .pointer("/results/0/id")
            .and_then(|v| v.as_str())
            .map(String::from))
    }
}

#[async_trait]
impl DocumentStore for NotionStore {
    async fn ensure_container(&self, client_name: &str) -> Result<String, StoreError> {
        let body = json!({
            "parent": { "type": "page_id", "page_id": self.parent_page_id },
            "title": [{ "type": "text", "text": { "content": format!("{} — Sessions", client_name) } }],
            "properties": container_schema(),
        });

        let response = send_with_retry(
            self.request(reqwest::Method::POST, "/databases").json(&body),
            &self.retry,
        )
        .await?;
        let payload = Self::expect_json(response).await?;

        payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| StoreError::MalformedResponse("database create: no id".to_string()))
    }

    async fn upsert_record(
        &self,
        container_ref: &str,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let properties = record_to_properties(record);

        match self
            .find_record_page(container_ref, &record.transcript_id)
            .await?
        {
            Some(page_id) => {
                let response = send_with_retry(
                    self.request(reqwest::Method::PATCH, &format!("/pages/{}", page_id))
                        .json(&json!({ "properties": properties })),
                    &self.retry,
                )
                .await?;
                Self::expect_json(response).await?;
            }
            None => {
                let body = json!({
                    "parent": { "database_id": container_ref },
                    "properties": properties,
                    "children": record_body_blocks(record),
                });
                let response = send_with_retry(
                    self.request(reqwest::Method::POST, "/pages").json(&body),
                    &self.retry,
                )
                .await?;
                Self::expect_json(response).await?;
            }
        }
        Ok(())
    }
}

fn container_schema() -> Value {
    json!({
        "Name": { "title": {} },
        "Transcript ID": { "rich_text": {} },
        "Session Date": { "date": {} },
        "Provider": { "select": {} },
        "Sentiment": { "number": {} },
        "Key Themes": { "multi_select": {} },
        "Summary": { "rich_text": {} },
    })
}

fn truncate(text: &str) -> String {
    let mut end = text.len().min(MAX_RICH_TEXT);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn rich_text(content: &str) -> Value {
    json!({ "rich_text": [{ "type": "text", "text": { "content": truncate(content) } }] })
}

/// Project a session record into Notion page properties.
pub fn record_to_properties(record: &SessionRecord) -> Value {
    let title = match &record.session_date {
        Some(date) => format!("Session {}", date),
        None => format!("Session ({})", &record.transcript_id[..record.transcript_id.len().min(8)]),
    };

    let mut properties = json!({
        "Name": { "title": [{ "type": "text", "text": { "content": title } }] },
        "Transcript ID": rich_text(&record.transcript_id),
        "Provider": { "select": { "name": &record.provider_name } },
        "Key Themes": {
            "multi_select": record.analysis.key_themes.iter()
                .map(|t| json!({ "name": truncate(t) }))
                .collect::<Vec<_>>()
        },
    });

    if let Some(date) = &record.session_date {
        properties["Session Date"] = json!({ "date": { "start": date } });
    }
    if let Some(score) = record.analysis.sentiment_score {
        properties["Sentiment"] = json!({ "number": score });
    }
    if let Some(summary) = &record.analysis.summary {
        properties["Summary"] = rich_text(summary);
    }

    properties
}

/// Read the canonical fields back out of Notion page properties.
pub fn properties_to_summary_fields(
    properties: &Value,
) -> (Option<String>, Vec<String>, Option<f64>) {
    let summary = properties
        .pointer("/Summary/rich_text/0/text/content")
        .and_then(|v| v.as_str())
        .map(String::from);
    let key_themes = properties
        .pointer("/Key Themes/multi_select")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("name").and_then(|n| n.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let sentiment = properties
        .pointer("/Sentiment/number")
        .and_then(|v| v.as_f64());
    (summary, key_themes, sentiment)
}

/// Page body: summary paragraph plus the SOAP sections that exist.
fn record_body_blocks(record: &SessionRecord) -> Vec<Value> {
    let mut blocks = Vec::new();

    if let Some(summary) = &record.analysis.summary {
        blocks.push(heading("Summary"));
        blocks.push(paragraph(summary));
    }

    let note = &record.analysis.structured_note;
    for (label, section) in [
        ("Subjective", &note.subjective),
        ("Objective", &note.objective),
        ("Assessment", &note.assessment),
        ("Plan", &note.plan),
    ] {
        if let Some(text) = section {
            blocks.push(heading(label));
            blocks.push(paragraph(text));
        }
    }

    blocks
}

fn heading(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "heading_2",
        "heading_2": { "rich_text": [{ "type": "text", "text": { "content": text } }] }
    })
}

fn paragraph(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": [{ "type": "text", "text": { "content": truncate(text) } }] }
    })
}
