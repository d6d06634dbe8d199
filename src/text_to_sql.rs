//! text_to_sql.rs — natural language question → SQL via Gemini.
//!
//! The prompt keeps the user's language for reading the question but asks for
//! an English SQL statement in the requested dialect.

use serde::Deserialize;

use crate::error::ApiError;
use crate::gemini::GeminiClient;
use crate::logging::{backend_error, backend_info};

pub const DEFAULT_DATABASE_TYPE: &str = "mysql";
pub const DEFAULT_LANGUAGE: &str = "English";

#[derive(Debug, Deserialize)]
pub struct TextToSqlRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "databaseType", default = "default_database_type")]
    pub database_type: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_database_type() -> String { DEFAULT_DATABASE_TYPE.to_string() }
fn default_language() -> String { DEFAULT_LANGUAGE.to_string() }

/// Build the Gemini prompt for converting `text` into `database_type` SQL.
pub fn build_prompt(text: &str, database_type: &str, language: &str) -> String {
    format!(
        "The following query is written in {language}.Keep it in that language only, \
         but then convert it into a strict SQL query in English for a {database_type} database:\
         \n\n\"{text}\"\n\n\
         Return only the SQL query without any explanation or markdown or any special character \
         or bullet points asterisks. Autocomplete the query if it's incomplete."
    )
}

/// Strip whitespace and a surrounding markdown code fence, if the model added one.
pub fn clean_sql(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("```sql")
        .trim_start_matches("```SQL")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}

/// Convert `text` to SQL. Empty input is rejected before any LLM call.
pub async fn text_to_sql(
    gemini: &GeminiClient,
    text: &str,
    database_type: &str,
    language: &str,
) -> Result<String, ApiError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest("No text provided".into()));
    }

    backend_info(format!(
        "text_to_sql invoked (dialect='{}', language='{}', text_len={})",
        database_type,
        language,
        text.len()
    ));

    let prompt = build_prompt(text, database_type, language);
    let raw = gemini.generate(&prompt).await.map_err(|err| {
        backend_error(format!("Text-to-SQL error: {}", err));
        ApiError::Internal("Failed to convert text to SQL".into())
    })?;

    let sql = raw.as_deref().map(clean_sql).unwrap_or_default();
    if sql.is_empty() {
        backend_error("Gemini response had no SQL text");
        return Err(ApiError::Internal("Failed to generate SQL query".into()));
    }

    backend_info(format!("Generated SQL: {}", sql));
    Ok(sql)
}
