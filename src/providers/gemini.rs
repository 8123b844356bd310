//! Google Gemini generateContent adapter.

use async_trait::async_trait;
use serde_json::json;

use super::{
    build_prompt, error_from_response, parse_model_json, AnalysisProvider, ProviderAnalysis,
    ProviderError,
};
use crate::config::DEFAULT_PROMPT_PROFILE;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiProvider {
    name: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
    prompt_profile: String,
}

impl GeminiProvider {
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
impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(
        &self,
        text: &str,
        client_name: &str,
    ) -> Result<ProviderAnalysis, ProviderError> {
        let prompt = build_prompt(&self.prompt_profile, client_name, text);
        let url = format!("{}/{}:generateContent", API_BASE, self.model);
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.2,
            },
        });

        let response = self
            .client
            .post(&url)
            // Gemini authenticates via query parameter, not a header.
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let raw: serde_json::Value = response.json().await?;
        let content = raw
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::MalformedResponse(
                    "missing candidates[0].content.parts[0].text".to_string(),
                )
            })?;

        let normalized = parse_model_json(content)?;
        Ok(ProviderAnalysis { normalized, raw })
    }
}
