//! pipeline.rs — question → SQL → guard → execute → store, in one call.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::db::{self, ConnectionParams};
use crate::error::ApiError;
use crate::gemini::GeminiClient;
use crate::logging::backend_info;
use crate::session::SessionStore;
use crate::sql_guard::{self, Classifier, GuardReport};
use crate::text_to_sql;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskOutcome {
    pub sql_query: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub guard: GuardReport,
}

pub struct AskContext<'a> {
    pub gemini: &'a GeminiClient,
    pub classifier: Option<&'a Classifier>,
    pub sessions: &'a SessionStore,
    pub enforce_guard: bool,
    pub timeout: Duration,
}

pub async fn ask(
    ctx: &AskContext<'_>,
    session_id: &str,
    text: &str,
    language: &str,
    confirmed: bool,
) -> Result<AskOutcome, ApiError> {
    let state = ctx.sessions.load(session_id).await?;
    let connection: ConnectionParams = state
        .connection
        .ok_or_else(|| ApiError::NotFound("No database connection configured".into()))?;
    let target = connection.for_connect()?;

    let sql = text_to_sql::text_to_sql(ctx.gemini, text, target.kind.dialect(), language).await?;

    let guard = sql_guard::check(&sql, ctx.classifier, None).await;
    if ctx.enforce_guard {
        guard.admit(confirmed)?;
    }

    backend_info(format!("ask: executing generated SQL for session '{}'", session_id));
    match db::execute_query(&target, &sql, ctx.timeout).await {
        Ok(outcome) => {
            let data = outcome.into_json();
            ctx.sessions.record_result(session_id, &sql, &data).await;
            Ok(AskOutcome {
                sql_query: sql,
                success: true,
                data: Some(data),
                error: None,
                guard,
            })
        }
        Err(ApiError::Database(message)) => Ok(AskOutcome {
            sql_query: sql,
            success: false,
            data: None,
            error: Some(message),
            guard,
        }),
        Err(other) => Err(other),
    }
}
