//! assistant.rs — chat assistant and schema descriptions, both backed by Gemini.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::error::ApiError;
use crate::gemini::GeminiClient;
use crate::logging::{backend_error, backend_info};

pub const FALLBACK_REPLY: &str = "I'm sorry, I didn't understand that.";

lazy_static! {
    static ref ITALIC: Regex = Regex::new(r"\*([^*]+)\*").unwrap();
    static ref BULLET: Regex = Regex::new(r"(?m)^\s*\* ").unwrap();
    static ref BLANK_LINES: Regex = Regex::new(r"\n{2,}").unwrap();
    static ref TRAILING_WS: Regex = Regex::new(r"[ \t]+\n").unwrap();
    static ref LEADING_WS: Regex = Regex::new(r"\n[ \t]+").unwrap();
    static ref JSON_FENCE: Regex = Regex::new(r"```json([\s\S]*?)```").unwrap();
    static ref ANY_FENCE: Regex = Regex::new(r"```([\s\S]*?)```").unwrap();
    static ref JSON_OBJECT: Regex = Regex::new(r"\{[\s\S]*\}").unwrap();
}

/// Strip markdown emphasis and tidy whitespace for plain-text chat bubbles.
pub fn clean_reply(text: &str) -> String {
    let text = text.replace("**", "");
    let text = ITALIC.replace_all(&text, "$1");
    let text = BULLET.replace_all(&text, "- ");
    let text = BLANK_LINES.replace_all(&text, "\n");
    let text = TRAILING_WS.replace_all(&text, "\n");
    let text = LEADING_WS.replace_all(&text, "\n");
    text.trim().to_string()
}

/// Pull a JSON document out of a model reply that may wrap it in prose or fences.
pub fn extract_json(text: &str) -> &str {
    if let Some(inner) = JSON_FENCE.captures(text).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if let Some(inner) = ANY_FENCE.captures(text).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if let Some(obj) = JSON_OBJECT.find(text) {
        return obj.as_str().trim();
    }
    text.trim()
}

pub async fn chat(gemini: &GeminiClient, message: &str) -> Result<String, ApiError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("No message provided".into()));
    }
    backend_info(format!("Assistant chat invoked (message_len={})", message.len()));

    let reply = gemini.generate(message).await?;
    Ok(reply
        .map(|r| clean_reply(&r))
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| FALLBACK_REPLY.to_string()))
}

pub fn describe_prompt(schema_result: &Value) -> String {
    format!(
        r#"Return ONLY raw JSON (without any markdown or code block formatting) with this exact structure, adding a one liner description of the each column:
{{
  "success": boolean,
  "data": [
    {{
      "TABLE_NAME": string,
      "COLUMN_NAME": string,
      "DESCRIPTION": string
    }}
  ]
}}

Here is the data to format:
{schema_result}"#
    )
}

/// Ask Gemini to annotate the `(table, column)` listing with one-line descriptions.
pub async fn describe_tables(gemini: &GeminiClient, schema_result: &Value) -> Result<Value, ApiError> {
    let reply = gemini
        .generate(&describe_prompt(schema_result))
        .await?
        .ok_or_else(|| ApiError::Upstream("Failed to get descriptions from Gemini.".into()))?;

    serde_json::from_str(extract_json(&reply)).map_err(|e| {
        backend_error(format!("Failed to parse cleaned JSON: {}", e));
        ApiError::Upstream("Failed to parse table descriptions.".into())
    })
}

/// Distinct table names from rows carrying `TABLE_NAME` (any case), in order.
pub fn table_names(rows: &Value) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for row in rows.as_array().into_iter().flatten() {
        let Some(obj) = row.as_object() else { continue };
        let name = obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("table_name"))
            .and_then(|(_, v)| v.as_str());
        if let Some(name) = name {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}
