//! server.rs — HTTP surface: shared state, extractors, route handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Request, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::assistant;
use crate::charts;
use crate::db::{self, ConnectionParams};
use crate::error::ApiError;
use crate::gemini::GeminiClient;
use crate::logging::{backend_error, backend_info, backend_warn};
use crate::pipeline::{self, AskContext};
use crate::session::{self, SessionStore, DEFAULT_SESSION_ID};
use crate::settings::ServerSettings;
use crate::speech::{Base64SpeechRequest, SpeechClient};
use crate::sql_guard::{self, Classifier};
use crate::text_to_sql::{self, TextToSqlRequest};

pub const SESSION_HEADER: &str = "x-session-id";

pub struct AppState {
    pub settings: ServerSettings,
    pub http: reqwest::Client,
    pub gemini: GeminiClient,
    pub speech: SpeechClient,
    pub classifier: Option<Classifier>,
    pub sessions: SessionStore,
    started_at: Instant,
}

impl AppState {
    pub fn from_settings(settings: ServerSettings) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to build HTTP client: {e}")))?;

        let gemini = GeminiClient::new(
            http.clone(),
            &settings.gemini_base_url,
            &settings.gemini_model,
            &settings.gemini_api_key,
        );
        let speech = SpeechClient::new(
            http.clone(),
            &settings.speech_base_url,
            &settings.speech_api_key,
            &settings.speech_encoding,
            settings.max_audio_bytes,
        );
        let classifier = settings
            .classifier_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(|url| Classifier::new(http.clone(), url, &settings.classifier_model));
        let sessions = SessionStore::new(settings.resolved_session_dir());

        Ok(Self {
            settings,
            http,
            gemini,
            speech,
            classifier,
            sessions,
            started_at: Instant::now(),
        })
    }

    fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.http_timeout_secs)
    }
}

type SharedState = Arc<AppState>;

// ── Extractors ───────────────────────────────────────

/// JSON body whose rejections use the `{error}` contract.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    backend_warn(format!("Rejected request body: {}", rejection.body_text()));
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge("Request body is too large".into());
    }
    ApiError::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return audio_too_large();
    }
    ApiError::BadRequest(format!("Invalid form data: {}", err.body_text()))
}

fn audio_too_large() -> ApiError {
    ApiError::PayloadTooLarge("Audio file is too large".into())
}

/// Session id from the `x-session-id` header, `default` when absent.
pub struct SessionId(pub String);

impl<S> FromRequestParts<S> for SessionId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = match parts.headers.get(SESSION_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Invalid session id".into()))?,
            None => DEFAULT_SESSION_ID,
        };
        Ok(SessionId(session::validate_session_id(raw.trim())?.to_string()))
    }
}

// ── Router ───────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    // base64 inflates audio by 4/3; leave headroom for the JSON envelope.
    let body_limit = state.settings.max_audio_bytes.saturating_mul(2) + 64 * 1024;

    Router::new()
        .route("/health", get(health))
        .route("/api/settings", get(get_settings))
        .route("/api/database/connect", post(database_connect))
        .route("/api/database/execute", post(database_execute))
        .route("/api/database/tables", post(database_tables))
        .route("/api/text-to-sql", post(text_to_sql_handler))
        .route("/api/speech-to-text", post(speech_multipart))
        .route("/api/speech-to-text/base64", post(speech_base64))
        .route("/api/query/check", post(query_check))
        .route("/api/chat", post(chat))
        .route("/api/charts", post(charts_handler))
        .route("/api/ask", post(ask))
        .route("/api/session", axum::routing::delete(session_clear))
        .route("/api/session/connection", get(session_connection))
        .route("/api/session/result", get(session_result))
        .route("/api/session/overview", get(session_overview))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until Ctrl-C.
pub async fn run(settings: ServerSettings) -> anyhow::Result<()> {
    let addr = settings.bind_addr.clone();
    let state = Arc::new(AppState::from_settings(settings)?);
    if state.settings.gemini_api_key.is_empty() {
        backend_warn("GEMINI_API_KEY not set; text-to-SQL and chat will fail");
    }
    if state.settings.speech_api_key.is_empty() {
        backend_warn("GOOGLE_SPEECH_API_KEY not set; speech-to-text will fail");
    }
    backend_info(format!("Session store: {}", state.sessions.dir().display()));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    backend_info(format!("voiceviz service starting on {}", addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                backend_error(format!("Failed to listen for shutdown signal: {}", err));
            }
        })
        .await?;

    backend_info("voiceviz service stopped gracefully");
    Ok(())
}

// ── Handlers ─────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "voiceviz".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn get_settings(State(state): State<SharedState>) -> Json<Value> {
    let mut body = serde_json::to_value(&state.settings).unwrap_or_else(|_| json!({}));
    body["geminiConfigured"] = json!(!state.settings.gemini_api_key.is_empty());
    body["speechConfigured"] = json!(!state.settings.speech_api_key.is_empty());
    body["classifierConfigured"] = json!(state.classifier.is_some());
    Json(body)
}

async fn database_connect(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
    ApiJson(params): ApiJson<ConnectionParams>,
) -> Result<Json<Value>, ApiError> {
    backend_info(format!("Command database_connect invoked: {:?}", params));
    let target = params.for_connect()?;

    db::test_connection(&target, state.db_timeout()).await?;

    if let Err(err) = state.sessions.save_connection(&session_id, &params).await {
        backend_warn(format!("Connection succeeded but could not be stored: {}", err));
    }

    Ok(Json(json!({
        "success": true,
        "message": "Database connection successful",
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(flatten)]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
}

async fn database_execute(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
    ApiJson(req): ApiJson<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    backend_info(format!("Command database_execute invoked: {:?}", req.connection));

    let target = req.connection.for_execute()?;
    let query = req
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing required parameters".into()))?;

    if state.settings.enforce_query_guard {
        sql_guard::local_report(query).admit(req.confirmed)?;
    }

    match db::execute_query(&target, query, state.db_timeout()).await {
        Ok(outcome) => {
            let data = outcome.into_json();
            state.sessions.record_result(&session_id, query, &data).await;
            Ok(Json(json!({ "success": true, "data": data })))
        }
        // Driver errors are part of the response body, not the status line.
        Err(ApiError::Database(message)) => Ok(Json(json!({ "success": false, "error": message }))),
        Err(other) => Err(other),
    }
}

async fn database_tables(
    State(state): State<SharedState>,
    ApiJson(params): ApiJson<ConnectionParams>,
) -> Result<Json<Value>, ApiError> {
    backend_info(format!("Command database_tables invoked: {:?}", params));
    let target = params.for_connect()?;

    let rows = db::execute_query(&target, target.kind.schema_query(), state.db_timeout())
        .await?
        .into_json();
    let tables = assistant::table_names(&rows);
    let schema_result = json!({ "success": true, "data": rows });

    let mut body = json!({ "success": true, "tables": tables, "data": rows });
    match assistant::describe_tables(&state.gemini, &schema_result).await {
        Ok(descriptions) => body["descriptions"] = descriptions,
        Err(err) => {
            backend_warn(format!("Table descriptions unavailable: {}", err));
            body["descriptions"] = Value::Null;
            body["descriptionError"] = json!(err.to_string());
        }
    }
    Ok(Json(body))
}

async fn text_to_sql_handler(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<TextToSqlRequest>,
) -> Result<Json<Value>, ApiError> {
    let text = req.text.as_deref().unwrap_or("");
    let sql = text_to_sql::text_to_sql(&state.gemini, text, &req.database_type, &req.language).await?;
    Ok(Json(json!({ "sqlQuery": sql })))
}

async fn speech_multipart(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut audio: Option<Vec<u8>> = None;
    let mut language: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        match field.name() {
            Some("audio") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?;
                audio = Some(bytes.to_vec());
            }
            Some("language") => {
                let text = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                language = Some(text);
            }
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| ApiError::BadRequest("Audio file is required".into()))?;
    let language = pick_language(language, &state.settings.default_language_code);
    backend_info(format!("Command speech_to_text invoked (bytes={}, language='{}')", audio.len(), language));

    let transcription = state.speech.transcribe_bytes(&audio, &language).await?;
    Ok(Json(json!({ "transcription": transcription })))
}

async fn speech_base64(
    State(state): State<SharedState>,
    body: Result<ApiJson<Base64SpeechRequest>, ApiError>,
) -> Result<Json<Value>, ApiError> {
    let ApiJson(req) = body.map_err(|err| match err {
        ApiError::PayloadTooLarge(_) => audio_too_large(),
        other => other,
    })?;
    let audio = req
        .audio
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Audio file is required".into()))?;
    let language = pick_language(req.language, &state.settings.default_language_code);

    let transcription = state.speech.transcribe_base64(&audio, &language).await?;
    Ok(Json(json!({ "transcription": transcription })))
}

fn pick_language(requested: Option<String>, fallback: &str) -> String {
    requested
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

async fn query_check(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CheckRequest>,
) -> Result<Json<sql_guard::GuardReport>, ApiError> {
    let query = req
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No query provided".into()))?;

    let report = sql_guard::check(query, state.classifier.as_ref(), req.model.as_deref()).await;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

async fn chat(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let reply = assistant::chat(&state.gemini, &req.message).await?;
    Ok(Json(json!({ "reply": reply })))
}

async fn charts_handler(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let data = if body.iter().all(u8::is_ascii_whitespace) {
        state
            .sessions
            .load(&session_id)
            .await?
            .last_result
            .map(|r| r.data)
            .ok_or_else(|| ApiError::NotFound("No query result to chart".into()))?
    } else {
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?;
        parsed
            .get("data")
            .cloned()
            .ok_or_else(|| ApiError::BadRequest("Invalid data format.".into()))?
    };

    let archive = charts::generate_charts(&state.http, &state.settings.chart_service_url, &data).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, archive.content_type)],
        archive.bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
}

async fn ask(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
    ApiJson(req): ApiJson<AskRequest>,
) -> Result<Json<pipeline::AskOutcome>, ApiError> {
    let language = pick_language(req.language, text_to_sql::DEFAULT_LANGUAGE);
    let ctx = AskContext {
        gemini: &state.gemini,
        classifier: state.classifier.as_ref(),
        sessions: &state.sessions,
        enforce_guard: state.settings.enforce_query_guard,
        timeout: state.db_timeout(),
    };
    let outcome = pipeline::ask(&ctx, &session_id, &req.text, &language, req.confirmed).await?;
    Ok(Json(outcome))
}

async fn session_connection(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
) -> Result<Json<ConnectionParams>, ApiError> {
    state
        .sessions
        .load(&session_id)
        .await?
        .connection
        .map(|c| Json(c.masked()))
        .ok_or_else(|| ApiError::NotFound("No database connection stored".into()))
}

async fn session_result(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
) -> Result<Json<session::StoredResult>, ApiError> {
    state
        .sessions
        .load(&session_id)
        .await?
        .last_result
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No query result stored".into()))
}

async fn session_overview(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
) -> Result<Json<session::DatasetOverview>, ApiError> {
    let result = state
        .sessions
        .load(&session_id)
        .await?
        .last_result
        .ok_or_else(|| ApiError::NotFound("No query result stored".into()))?;

    session::overview(&result.data)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Last result is not tabular".into()))
}

async fn session_clear(
    State(state): State<SharedState>,
    SessionId(session_id): SessionId,
) -> Result<StatusCode, ApiError> {
    state.sessions.clear(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
