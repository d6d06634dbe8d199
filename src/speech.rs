//! speech.rs — Speech-to-Text via the Google Cloud Speech REST API.
//! Accepts raw audio bytes (multipart upload) or base64 (JSON body).

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::logging::{backend_error, backend_info, backend_warn, truncate_for_log};

#[derive(Clone)]
pub struct SpeechClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    encoding: String,
    max_audio_bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct Base64SpeechRequest {
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl SpeechClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        encoding: &str,
        max_audio_bytes: usize,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            encoding: encoding.to_string(),
            max_audio_bytes,
        }
    }

    /// Size checks shared by both upload paths.
    pub fn check_audio_len(&self, len: usize) -> Result<(), ApiError> {
        if len == 0 {
            return Err(ApiError::BadRequest("Audio file is required".into()));
        }
        if len > self.max_audio_bytes {
            return Err(ApiError::PayloadTooLarge("Audio file is too large".into()));
        }
        Ok(())
    }

    pub async fn transcribe_bytes(&self, audio: &[u8], language_code: &str) -> Result<String, ApiError> {
        self.check_audio_len(audio.len())?;
        let content = general_purpose::STANDARD.encode(audio);
        self.recognize(&content, language_code).await
    }

    pub async fn transcribe_base64(&self, audio_base64: &str, language_code: &str) -> Result<String, ApiError> {
        let trimmed = audio_base64.trim();
        // Accept data URLs as produced by FileReader.readAsDataURL.
        let payload = trimmed
            .split_once(";base64,")
            .map_or(trimmed, |(_, data)| data);

        let bytes = general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ApiError::BadRequest(format!("Invalid base64 audio: {e}")))?;
        self.check_audio_len(bytes.len())?;
        self.recognize(payload, language_code).await
    }

    async fn recognize(&self, content_base64: &str, language_code: &str) -> Result<String, ApiError> {
        if self.api_key.is_empty() {
            backend_error("GOOGLE_SPEECH_API_KEY not set — speech recognition unavailable");
            return Err(ApiError::Internal("Failed to process speech to text".into()));
        }

        backend_info(format!(
            "Sending {}KB audio to speech API (language='{}', encoding='{}')",
            content_base64.len() / 1024,
            language_code,
            self.encoding
        ));

        let body = serde_json::json!({
            "config": {
                "encoding": self.encoding,
                "languageCode": language_code,
            },
            "audio": { "content": content_base64 }
        });

        let resp = self
            .http
            .post(format!("{}/speech:recognize", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                backend_error(format!("Speech-to-text request failed: {}", e));
                ApiError::Internal("Failed to process speech to text".into())
            })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            backend_error(format!(
                "Speech-to-text HTTP {}: {}",
                status,
                truncate_for_log(&text, 300)
            ));
            return Err(map_upstream_error(&text));
        }

        let data: Value = serde_json::from_str(&text).map_err(|e| {
            backend_error(format!("Speech-to-text JSON parse error: {}", e));
            ApiError::Internal("Failed to process speech to text".into())
        })?;

        let transcription = join_transcripts(&data);
        if transcription.is_empty() {
            backend_warn("Speech API returned no transcript");
            return Err(ApiError::BadRequest("No transcription available".into()));
        }

        backend_info(format!(
            "Transcription: \"{}\"",
            truncate_for_log(&transcription, 120)
        ));
        Ok(transcription)
    }
}

/// First alternative of every result, blanks dropped, one per line.
pub fn join_transcripts(data: &Value) -> String {
    data["results"]
        .as_array()
        .map(|results| {
            results
                .iter()
                .filter_map(|r| r["alternatives"][0]["transcript"].as_str())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Translate a Google API error body into the route's error contract.
pub fn map_upstream_error(body: &str) -> ApiError {
    let status = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["status"].as_str().map(str::to_string))
        .unwrap_or_default();

    match status.as_str() {
        "PERMISSION_DENIED" | "UNAUTHENTICATED" => {
            ApiError::PermissionDenied("Permission denied. Check your API credentials.".into())
        }
        "INVALID_ARGUMENT" => ApiError::BadRequest("Invalid audio format or configuration.".into()),
        _ => ApiError::Internal("Failed to process speech to text".into()),
    }
}
