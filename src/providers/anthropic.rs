//! Anthropic messages-API adapter.

use async_trait::async_trait;
use serde_json::json;

use super::{
    build_prompt, error_from_response, parse_model_json, AnalysisProvider, ProviderAnalysis,
    ProviderError,
};
use crate::config::DEFAULT_PROMPT_PROFILE;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 2048;

pub struct AnthropicProvider {
    name: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    prompt_profile: String,
}

impl AnthropicProvider {
    pub fn new(name: String, model: String, api_key: String, client: reqwest::Client) -> Self {
        Self {
            name,
            model,
            api_key,
            client,
            prompt_profile: DEFAULT_PROMPT_PROFILE.to_string(),
        }
    }

    pub fn with_prompt_profile(mut self, profile: String) -> Self {
        self.prompt_profile = profile;
        self
    }
}

#[async_trait]
impl AnalysisProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(
        &self,
        text: &str,
        client_name: &str,
    ) -> Result<ProviderAnalysis, ProviderError> {
        let prompt = build_prompt(&self.prompt_profile, client_name, text);
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let raw: serde_json::Value = response.json().await?;
        let content = raw
            .pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("missing content[0].text".to_string())
            })?;

        let normalized = parse_model_json(content)?;
        Ok(ProviderAnalysis { normalized, raw })
    }
}
