//! Server settings: a JSON file in the config directory, overridden by
//! environment variables at startup.

use crate::logging::{backend_error, backend_info, backend_warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default, skip_serializing)]
    pub gemini_api_key: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
    #[serde(default, skip_serializing)]
    pub speech_api_key: String,
    #[serde(default = "default_speech_base_url")]
    pub speech_base_url: String,
    #[serde(default = "default_speech_encoding")]
    pub speech_encoding: String,
    #[serde(default = "default_language_code")]
    pub default_language_code: String,
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,
    #[serde(default)]
    pub classifier_url: Option<String>,
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,
    #[serde(default = "default_chart_service_url")]
    pub chart_service_url: String,
    #[serde(default = "default_enforce_query_guard")]
    pub enforce_query_guard: bool,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
}

fn default_bind_addr() -> String { "0.0.0.0:3001".to_string() }
fn default_gemini_model() -> String { "gemini-2.0-flash".to_string() }
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_speech_base_url() -> String { "https://speech.googleapis.com/v1".to_string() }
fn default_speech_encoding() -> String { "WEBM_OPUS".to_string() }
fn default_language_code() -> String { "en-US".to_string() }
fn default_max_audio_bytes() -> usize { 10 * 1024 * 1024 }
fn default_classifier_model() -> String { "model_1".to_string() }
fn default_chart_service_url() -> String {
    "http://127.0.0.1:8000/generate-graphs".to_string()
}
fn default_enforce_query_guard() -> bool { true }
fn default_http_timeout_secs() -> u64 { 30 }

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            gemini_api_key: String::new(),
            gemini_model: default_gemini_model(),
            gemini_base_url: default_gemini_base_url(),
            speech_api_key: String::new(),
            speech_base_url: default_speech_base_url(),
            speech_encoding: default_speech_encoding(),
            default_language_code: default_language_code(),
            max_audio_bytes: default_max_audio_bytes(),
            classifier_url: None,
            classifier_model: default_classifier_model(),
            chart_service_url: default_chart_service_url(),
            enforce_query_guard: default_enforce_query_guard(),
            http_timeout_secs: default_http_timeout_secs(),
            session_dir: None,
        }
    }
}

impl ServerSettings {
    /// Apply environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("VOICEVIZ_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.gemini_api_key = v;
        }
        if let Some(v) = get("GEMINI_MODEL") {
            self.gemini_model = v;
        }
        if let Some(v) = get("GOOGLE_SPEECH_API_KEY") {
            self.speech_api_key = v;
        }
        if let Some(v) = get("SQL_CLASSIFIER_URL") {
            self.classifier_url = Some(v);
        }
        if let Some(v) = get("CHART_SERVICE_URL") {
            self.chart_service_url = v;
        }
    }

    pub fn resolved_session_dir(&self) -> PathBuf {
        self.session_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("voiceviz")
                .join("sessions")
        })
    }
}

pub fn settings_path() -> PathBuf {
    if let Ok(explicit) = env::var("VOICEVIZ_CONFIG") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit);
        }
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voiceviz");
    if let Err(err) = fs::create_dir_all(&config_dir) {
        backend_warn(format!(
            "Failed to create config directory {}: {}",
            config_dir.display(),
            err
        ));
    }
    config_dir.join("settings.json")
}

/// Load settings from `path`, falling back to defaults when the file is
/// missing or unreadable. Env overrides are not applied here.
pub fn load_settings_from(path: &std::path::Path) -> ServerSettings {
    if !path.exists() {
        backend_warn(format!("Settings file not found at {}. Using defaults.", path.display()));
        return ServerSettings::default();
    }

    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) => {
            backend_error(format!("Failed to read settings file {}: {}", path.display(), err));
            return ServerSettings::default();
        }
    };

    match serde_json::from_str::<ServerSettings>(&data) {
        Ok(settings) => {
            backend_info(format!("Settings loaded from {}", path.display()));
            settings
        }
        Err(err) => {
            backend_error(format!("Failed to parse settings {}: {}", path.display(), err));
            ServerSettings::default()
        }
    }
}

/// Resolve the settings file, load it and apply env overrides.
pub fn load_settings() -> ServerSettings {
    let path = settings_path();
    backend_info(format!("Resolved settings path: {}", path.display()));
    let mut settings = load_settings_from(&path);
    settings.apply_env_overrides();
    settings
}

/// Write settings as pretty JSON. API keys are never written back; they
/// belong in the environment.
pub fn save_settings(settings: &ServerSettings, path: &std::path::Path) -> Result<(), String> {
    let json = serde_json::to_string_pretty(settings).map_err(|e| {
        backend_error(format!("Failed to serialize settings: {}", e));
        e.to_string()
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::write(path, json).map_err(|e| {
        backend_error(format!("Failed to write settings file {}: {}", path.display(), e));
        e.to_string()
    })?;
    backend_info(format!("Settings saved to {}", path.display()));
    Ok(())
}
