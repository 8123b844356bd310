//! OpenAI chat-completions adapter.

use async_trait::async_trait;
use serde_json::json;

use super::{
    build_prompt, error_from_response, parse_model_json, AnalysisProvider, ProviderAnalysis,
    ProviderError,
};
use crate::config::DEFAULT_PROMPT_PROFILE;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    name: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    prompt_profile: String,
}

impl OpenAiProvider {
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
impl AnalysisProvider for OpenAiProvider {
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
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {"type": "json_object"},
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let raw: serde_json::Value = response.json().await?;
        let content = raw
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("missing choices[0].message.content".to_string())
            })?;

        let normalized = parse_model_json(content)?;
        Ok(ProviderAnalysis { normalized, raw })
    }
}
