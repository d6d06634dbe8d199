//! gemini.rs — Gemini `generateContent` client.
//! Calls are made server-side so the API key never reaches the browser.

use serde_json::Value;

use crate::error::ApiError;
use crate::logging::{backend_error, backend_info, truncate_for_log};

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.trim().to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a single user prompt and return the first candidate's text, or
    /// `None` when the response carries no text part.
    pub async fn generate(&self, prompt: &str) -> Result<Option<String>, ApiError> {
        if self.api_key.is_empty() {
            backend_error("GEMINI_API_KEY not set and no fallback available");
            return Err(ApiError::Internal("GEMINI_API_KEY not set".into()));
        }

        let payload = serde_json::json!({
            "contents": [
                { "role": "user", "parts": [ { "text": prompt } ] }
            ]
        });

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        backend_info(format!(
            "Gemini request prepared for {} (prompt_len={})",
            self.model,
            prompt.len()
        ));

        let resp = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                backend_error(format!("Gemini HTTP request failed: {}", e));
                ApiError::Upstream(format!("Gemini request failed: {e}"))
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let truncated = truncate_for_log(&body, 300);
            backend_error(format!("Gemini HTTP error {}: {}", status, truncated));
            return Err(ApiError::Upstream(format!(
                "Gemini API request failed: HTTP {status}: {truncated}"
            )));
        }

        let data: Value = serde_json::from_str(&body).map_err(|e| {
            backend_error(format!("Failed to parse Gemini JSON response: {}", e));
            ApiError::Upstream(format!("Gemini JSON parse error: {e}"))
        })?;

        let text = candidate_text(&data);
        backend_info(format!(
            "Gemini response extracted (model='{}', text_len={})",
            self.model,
            text.as_deref().map_or(0, str::len)
        ));
        Ok(text)
    }
}

/// `candidates[0].content.parts[0].text`
pub fn candidate_text(data: &Value) -> Option<String> {
    data["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .map(str::to_string)
}
