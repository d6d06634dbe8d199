use voiceviz::logging::{backend_info, backend_warn, init_logging};
use voiceviz::settings::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (in working directory)
    match dotenvy::dotenv() {
        Ok(path) => backend_info(format!("Loaded .env from: {:?}", path)),
        Err(e) => backend_warn(format!("Failed to load .env: {}", e)),
    }

    init_logging();
    backend_info("Booting voiceviz backend...");

    let settings = load_settings();
    match settings.gemini_api_key.len() {
        0 => backend_warn("GEMINI_API_KEY not found"),
        n => backend_info(format!("GEMINI_API_KEY loaded (length: {})", n)),
    }
    match settings.speech_api_key.len() {
        0 => backend_warn("GOOGLE_SPEECH_API_KEY not found"),
        n => backend_info(format!("GOOGLE_SPEECH_API_KEY loaded (length: {})", n)),
    }

    voiceviz::server::run(settings).await
}
