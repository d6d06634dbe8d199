//! session.rs — per-session persistence of the connection form and the last
//! query result, so every page can re-render the same data.
//!
//! One JSON file per session id under the session directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::db::ConnectionParams;
use crate::error::ApiError;
use crate::logging::{backend_info, backend_warn};

pub const DEFAULT_SESSION_ID: &str = "default";

lazy_static! {
    static ref SESSION_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub query: String,
    pub data: Value,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub connection: Option<ConnectionParams>,
    #[serde(default)]
    pub last_result: Option<StoredResult>,
}

pub struct SessionStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles across requests.
    write_lock: Mutex<()>,
}

pub fn validate_session_id(id: &str) -> Result<&str, ApiError> {
    if SESSION_ID.is_match(id) {
        Ok(id)
    } else {
        Err(ApiError::BadRequest("Invalid session id".into()))
    }
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ApiError> {
        let id = validate_session_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    pub async fn load(&self, id: &str) -> Result<SessionState, ApiError> {
        let path = self.path_for(id)?;
        read_state(&path).await
    }

    pub async fn save_connection(&self, id: &str, params: &ConnectionParams) -> Result<(), ApiError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        let mut state = read_state(&path).await?;
        state.connection = Some(params.clone());
        write_state(&self.dir, &path, &state).await?;
        backend_info(format!("Stored connection for session '{}'", id));
        Ok(())
    }

    pub async fn save_result(&self, id: &str, query: &str, data: &Value) -> Result<StoredResult, ApiError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        let mut state = read_state(&path).await?;
        let stored = StoredResult {
            query: query.to_string(),
            data: data.clone(),
            saved_at: Utc::now(),
        };
        state.last_result = Some(stored.clone());
        write_state(&self.dir, &path, &state).await?;
        Ok(stored)
    }

    /// Store a result after the statement has already run. A failed write
    /// is logged and swallowed: the caller must still report the outcome,
    /// otherwise a retry would run the statement twice.
    pub async fn record_result(&self, id: &str, query: &str, data: &Value) -> Option<StoredResult> {
        match self.save_result(id, query, data).await {
            Ok(stored) => Some(stored),
            Err(err) => {
                backend_warn(format!("Query ran but its result could not be stored: {}", err));
                None
            }
        }
    }

    pub async fn clear(&self, id: &str) -> Result<(), ApiError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ApiError::Internal(format!("Failed to clear session: {err}"))),
        }
    }
}

async fn read_state(path: &Path) -> Result<SessionState, ApiError> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(SessionState::default()),
        Err(err) => {
            return Err(ApiError::Internal(format!(
                "Failed to read session {}: {err}",
                path.display()
            )))
        }
    };

    match serde_json::from_str(&data) {
        Ok(state) => Ok(state),
        Err(err) => {
            backend_warn(format!(
                "Discarding unreadable session file {}: {}",
                path.display(),
                err
            ));
            Ok(SessionState::default())
        }
    }
}

async fn write_state(dir: &Path, path: &Path, state: &SessionState) -> Result<(), ApiError> {
    let internal = |e: std::io::Error| ApiError::Internal(format!("Failed to write session: {e}"));
    tokio::fs::create_dir_all(dir).await.map_err(internal)?;

    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| ApiError::Internal(format!("Failed to serialize session: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(internal)?;
    tokio::fs::rename(&tmp, path).await.map_err(internal)?;
    Ok(())
}

/// Summary of a tabular result, computed from its first row.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetOverview {
    pub total_entries: usize,
    pub total_columns: usize,
    pub columns: Vec<String>,
    pub column_types: Map<String, Value>,
    pub primary_key: Option<String>,
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Array(_) => "array",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Object(_) => "object",
    }
}

/// `None` unless `data` is a non-empty array whose first element is an object.
pub fn overview(data: &Value) -> Option<DatasetOverview> {
    let rows = data.as_array()?;
    let first = rows.first()?.as_object()?;

    let columns: Vec<String> = first.keys().cloned().collect();
    let column_types = first
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(json_type_name(value).to_string())))
        .collect();

    Some(DatasetOverview {
        total_entries: rows.len(),
        total_columns: columns.len(),
        primary_key: columns.first().cloned(),
        columns,
        column_types,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_ids_are_restricted() {
        assert!(validate_session_id("default").is_ok());
        assert!(validate_session_id("user_42-tab").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn overview_follows_first_row() {
        let data = json!([
            { "id": 1, "region": "EU", "total": "10.50", "tags": [], "note": null, "ok": true },
            { "id": 2, "region": "US", "total": "3.00", "tags": ["x"], "note": "n", "ok": false }
        ]);
        let ov = overview(&data).unwrap();
        assert_eq!(ov.total_entries, 2);
        assert_eq!(ov.total_columns, 6);
        assert_eq!(ov.columns, vec!["id", "region", "total", "tags", "note", "ok"]);
        assert_eq!(ov.primary_key.as_deref(), Some("id"));
        assert_eq!(ov.column_types["id"], "number");
        assert_eq!(ov.column_types["tags"], "array");
        assert_eq!(ov.column_types["note"], "null");
        assert_eq!(ov.column_types["ok"], "boolean");
    }

    #[test]
    fn overview_rejects_non_tabular_data() {
        assert!(overview(&json!([])).is_none());
        assert!(overview(&json!({ "affectedRows": 1 })).is_none());
        assert!(overview(&json!([1, 2, 3])).is_none());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));

        assert!(store.load("s1").await.unwrap().connection.is_none());

        let params: ConnectionParams = serde_json::from_value(json!({
            "type": "mysql", "host": "db", "port": "3306", "database": "shop"
        }))
        .unwrap();
        store.save_connection("s1", &params).await.unwrap();
        store.save_result("s1", "SELECT 1", &json!([{ "1": 1 }])).await.unwrap();

        let reopened = SessionStore::new(dir.path().join("sessions"));
        let state = reopened.load("s1").await.unwrap();
        assert_eq!(state.connection.unwrap().port, Some(3306));
        assert_eq!(state.last_result.unwrap().query, "SELECT 1");

        reopened.clear("s1").await.unwrap();
        assert!(reopened.load("s1").await.unwrap().last_result.is_none());
        reopened.clear("s1").await.unwrap();
    }

    #[tokio::test]
    async fn record_result_survives_unwritable_store() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let store = SessionStore::new(&blocker);

        assert!(store.save_result("s1", "DELETE FROM t", &json!({ "affectedRows": 1 })).await.is_err());
        assert!(store
            .record_result("s1", "DELETE FROM t", &json!({ "affectedRows": 1 }))
            .await
            .is_none());

        let ok = SessionStore::new(dir.path().join("sessions"));
        let stored = ok.record_result("s1", "SELECT 1", &json!([{ "1": 1 }])).await.unwrap();
        assert_eq!(stored.query, "SELECT 1");
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ nope").unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("bad").await.unwrap().connection.is_none());
    }
}
