//! db.rs — one-shot connections to the user's MySQL / PostgreSQL database.
//!
//! Every call opens a fresh connection, does its work and closes it again.
//! Rows come back as JSON objects keyed by column name, in column order.

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::postgres::types::{PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgTypeInfo, PgTypeKind, PgValueFormat};
use sqlx::types::chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, JsonValue, Uuid};
use sqlx::{Column, Connection, Row, TypeInfo, ValueRef};

use crate::error::{database_message, ApiError};
use crate::logging::{backend_info, backend_warn};

pub const MYSQL_DEFAULT_PORT: u16 = 3306;
pub const POSTGRES_DEFAULT_PORT: u16 = 5432;

/// Lists every column of every table in the connected schema.
pub const MYSQL_SCHEMA_QUERY: &str = "SELECT TABLE_NAME,COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() ORDER BY TABLE_NAME, ORDINAL_POSITION;";
pub const POSTGRES_SCHEMA_QUERY: &str = "SELECT table_name,column_name FROM information_schema.columns \
     WHERE table_schema = 'public' ORDER BY table_name, ordinal_position;";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    MySql,
    Postgres,
}

impl DbKind {
    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw.trim().to_lowercase().as_str() {
            "mysql" => Ok(DbKind::MySql),
            "postgres" | "postgresql" => Ok(DbKind::Postgres),
            _ => Err(ApiError::UnsupportedDatabase(raw.to_string())),
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            DbKind::MySql => MYSQL_DEFAULT_PORT,
            DbKind::Postgres => POSTGRES_DEFAULT_PORT,
        }
    }

    /// Dialect name used in LLM prompts.
    pub fn dialect(self) -> &'static str {
        match self {
            DbKind::MySql => "mysql",
            DbKind::Postgres => "postgresql",
        }
    }

    pub fn schema_query(self) -> &'static str {
        match self {
            DbKind::MySql => MYSQL_SCHEMA_QUERY,
            DbKind::Postgres => POSTGRES_SCHEMA_QUERY,
        }
    }
}

/// Connection fields as the front end sends them. Everything is optional
/// here; the two operations validate differently.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(rename = "type", default)]
    pub db_type: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ConnectionParams {
    /// Copy with the password replaced, safe to hand back to clients.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.as_deref().is_some_and(|p| !p.is_empty()) {
            copy.password = Some("********".to_string());
        }
        copy
    }

    /// Validation for the connectivity test: type, host and database are
    /// required; the port falls back to the engine default.
    pub fn for_connect(&self) -> Result<ConnectionTarget, ApiError> {
        let (Some(db_type), Some(host), Some(database)) = (
            non_empty(&self.db_type),
            non_empty(&self.host),
            non_empty(&self.database),
        ) else {
            return Err(ApiError::BadRequest(
                "Missing required connection parameters".into(),
            ));
        };

        let kind = DbKind::parse(db_type)?;
        Ok(ConnectionTarget {
            kind,
            host: host.to_string(),
            port: self.port.unwrap_or_else(|| kind.default_port()),
            database: database.to_string(),
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    /// Validation for query execution: every field is mandatory.
    pub fn for_execute(&self) -> Result<ConnectionTarget, ApiError> {
        let missing = || ApiError::BadRequest("Missing required parameters".into());
        let db_type = non_empty(&self.db_type).ok_or_else(missing)?;
        let host = non_empty(&self.host).ok_or_else(missing)?;
        let port = self.port.ok_or_else(missing)?;
        let database = non_empty(&self.database).ok_or_else(missing)?;
        let username = non_empty(&self.username).ok_or_else(missing)?;
        let password = non_empty(&self.password).ok_or_else(missing)?;

        Ok(ConnectionTarget {
            kind: DbKind::parse(db_type)?,
            host: host.to_string(),
            port,
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Accepts `3306`, `"3306"`, `""` and `null`.
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u64),
        Text(String),
    }

    let raw: Option<RawPort> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawPort::Number(n)) => u16::try_from(n)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("port out of range: {n}"))),
        Some(RawPort::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawPort::Text(s)) => s
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {s}"))),
    }
}

/// Validated connection target.
#[derive(Clone)]
pub struct ConnectionTarget {
    pub kind: DbKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}://{}@{}:{}/{}",
            self.kind, self.username, self.host, self.port, self.database
        )
    }
}

impl ConnectionTarget {
    fn mysql_options(&self) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database);
        if !self.username.is_empty() {
            opts = opts.username(&self.username);
        }
        if !self.password.is_empty() {
            opts = opts.password(&self.password);
        }
        opts
    }

    fn postgres_options(&self) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database);
        if !self.username.is_empty() {
            opts = opts.username(&self.username);
        }
        if !self.password.is_empty() {
            opts = opts.password(&self.password);
        }
        opts
    }
}

/// What a statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(Vec<Map<String, Value>>),
    Affected {
        rows_affected: u64,
        last_insert_id: Option<u64>,
    },
}

impl QueryOutcome {
    pub fn into_json(self) -> Value {
        match self {
            QueryOutcome::Rows(rows) => Value::Array(rows.into_iter().map(Value::Object).collect()),
            QueryOutcome::Affected {
                rows_affected,
                last_insert_id,
            } => {
                let mut data = json!({ "affectedRows": rows_affected });
                if let Some(id) = last_insert_id {
                    data["insertId"] = json!(id);
                }
                data
            }
        }
    }
}

/// Open a connection, ping it and close it.
pub async fn test_connection(target: &ConnectionTarget, timeout: Duration) -> Result<(), ApiError> {
    backend_info(format!("Testing database connection {:?}", target));

    let work = async {
        match target.kind {
            DbKind::MySql => {
                let mut conn = MySqlConnection::connect_with(&target.mysql_options()).await?;
                conn.ping().await?;
                conn.close().await?;
                Ok::<_, sqlx::Error>(())
            }
            DbKind::Postgres => {
                let mut conn = PgConnection::connect_with(&target.postgres_options()).await?;
                conn.ping().await?;
                conn.close().await?;
                Ok::<_, sqlx::Error>(())
            }
        }
    };

    with_timeout(work, timeout).await?;
    backend_info(format!("Database connection successful {:?}", target));
    Ok(())
}

/// Open a connection, run `sql` and close the connection.
pub async fn execute_query(
    target: &ConnectionTarget,
    sql: &str,
    timeout: Duration,
) -> Result<QueryOutcome, ApiError> {
    backend_info(format!("Executing query on {:?}", target));
    let wants_rows = returns_rows(sql);

    let work = async {
        match target.kind {
            DbKind::MySql => {
                let mut conn = MySqlConnection::connect_with(&target.mysql_options()).await?;
                let outcome = if wants_rows {
                    let rows = sqlx::query(sql).fetch_all(&mut conn).await?;
                    QueryOutcome::Rows(rows.iter().map(mysql_row_to_json).collect())
                } else {
                    let done = sqlx::query(sql).execute(&mut conn).await?;
                    let id = done.last_insert_id();
                    QueryOutcome::Affected {
                        rows_affected: done.rows_affected(),
                        last_insert_id: (id != 0).then_some(id),
                    }
                };
                conn.close().await?;
                Ok::<_, sqlx::Error>(outcome)
            }
            DbKind::Postgres => {
                let mut conn = PgConnection::connect_with(&target.postgres_options()).await?;
                let outcome = if wants_rows {
                    let rows = sqlx::query(sql).fetch_all(&mut conn).await?;
                    QueryOutcome::Rows(rows.iter().map(pg_row_to_json).collect())
                } else {
                    let done = sqlx::query(sql).execute(&mut conn).await?;
                    QueryOutcome::Affected {
                        rows_affected: done.rows_affected(),
                        last_insert_id: None,
                    }
                };
                conn.close().await?;
                Ok::<_, sqlx::Error>(outcome)
            }
        }
    };

    let outcome = with_timeout(work, timeout).await?;
    if let QueryOutcome::Rows(rows) = &outcome {
        backend_info(format!("Query returned {} rows", rows.len()));
    }
    Ok(outcome)
}

async fn with_timeout<T>(
    work: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    timeout: Duration,
) -> Result<T, ApiError> {
    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            let message = database_message(&err);
            backend_warn(format!("Database error: {}", message));
            Err(ApiError::Database(message))
        }
        Err(_) => Err(ApiError::Database(format!(
            "Database operation timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Whether a statement produces a result set.
pub fn returns_rows(sql: &str) -> bool {
    let stripped = strip_leading_comments(sql).trim_start_matches(|c: char| c == '(' || c.is_whitespace());
    let first = stripped
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    matches!(
        first.as_str(),
        "SELECT" | "SHOW" | "WITH" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            return rest;
        }
    }
}

fn mysql_row_to_json(row: &MySqlRow) -> Map<String, Value> {
    let mut map = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(_) => mysql_value(row, idx, column.type_info().name()),
            Err(_) => Value::Null,
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

fn mysql_value(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get_unchecked::<i64, _>(idx).map(Value::from)
        }
        t if t.ends_with("UNSIGNED") => row.try_get_unchecked::<u64, _>(idx).map(Value::from),
        "FLOAT" => row.try_get::<f32, _>(idx).map(f32_to_json),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(|f| json!(f)),
        "DECIMAL" => row.try_get::<Decimal, _>(idx).map(|d| Value::String(d.to_string())),
        "DATE" => row.try_get::<NaiveDate, _>(idx).map(|d| Value::String(d.to_string())),
        "TIME" => row.try_get::<NaiveTime, _>(idx).map(|t| Value::String(t.to_string())),
        "DATETIME" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMP" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(|dt| Value::String(dt.to_rfc3339())),
        "JSON" => row.try_get::<JsonValue, _>(idx),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|b| Value::String(general_purpose::STANDARD.encode(b))),
        _ => row.try_get_unchecked::<String, _>(idx).map(Value::String),
    };

    decoded.unwrap_or_else(|err| {
        backend_warn(format!("Cannot decode MySQL column {} ({}): {}", idx, type_name, err));
        Value::Null
    })
}

fn pg_row_to_json(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => {
                let format = raw.format();
                pg_value(row, idx, column.type_info(), format)
            }
            Err(_) => Value::Null,
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

/// Types whose binary encoding is the UTF-8 text itself.
fn pg_is_text_like(type_name: &str) -> bool {
    matches!(
        type_name.to_ascii_uppercase().as_str(),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "XML" | "UNKNOWN"
    )
}

fn pg_value(row: &PgRow, idx: usize, info: &PgTypeInfo, format: PgValueFormat) -> Value {
    let type_name = info.name();
    if format == PgValueFormat::Text {
        return pg_decoded(row.try_get_unchecked::<String, _>(idx).map(Value::String), idx, type_name);
    }
    match info.kind() {
        // information_schema columns are domains over name, varchar and int4
        PgTypeKind::Domain(base) => return pg_value(row, idx, base, format),
        PgTypeKind::Enum(_) => {
            return pg_decoded(row.try_get_unchecked::<String, _>(idx).map(Value::String), idx, type_name)
        }
        _ => {}
    }

    let decoded = match type_name {
        "BOOL" => row.try_get_unchecked::<bool, _>(idx).map(Value::from),
        "INT2" => row.try_get_unchecked::<i16, _>(idx).map(Value::from),
        "INT4" => row.try_get_unchecked::<i32, _>(idx).map(Value::from),
        "INT8" => row.try_get_unchecked::<i64, _>(idx).map(Value::from),
        "FLOAT4" => row.try_get_unchecked::<f32, _>(idx).map(f32_to_json),
        "FLOAT8" => row.try_get_unchecked::<f64, _>(idx).map(|f| json!(f)),
        "NUMERIC" => row.try_get_unchecked::<Decimal, _>(idx).map(|d| Value::String(d.to_string())),
        "MONEY" => row
            .try_get_unchecked::<PgMoney, _>(idx)
            .map(|m| Value::String(m.to_decimal(2).to_string())),
        "DATE" => row.try_get_unchecked::<NaiveDate, _>(idx).map(|d| Value::String(d.to_string())),
        "TIME" => row.try_get_unchecked::<NaiveTime, _>(idx).map(|t| Value::String(t.to_string())),
        "TIMETZ" => row
            .try_get_unchecked::<PgTimeTz<NaiveTime, FixedOffset>, _>(idx)
            .map(|t| Value::String(format!("{}{}", t.time, t.offset))),
        "TIMESTAMP" => row
            .try_get_unchecked::<NaiveDateTime, _>(idx)
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => row
            .try_get_unchecked::<DateTime<Utc>, _>(idx)
            .map(|dt| Value::String(dt.to_rfc3339())),
        "INTERVAL" => row.try_get_unchecked::<PgInterval, _>(idx).map(|i| interval_to_json(&i)),
        "JSON" | "JSONB" => row.try_get_unchecked::<JsonValue, _>(idx),
        "UUID" => row.try_get_unchecked::<Uuid, _>(idx).map(|u| Value::String(u.to_string())),
        "BYTEA" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .map(|b| Value::String(general_purpose::STANDARD.encode(b))),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => {
            row.try_get_unchecked::<Vec<Option<String>>, _>(idx).map(|v| json!(v))
        }
        "BOOL[]" => row.try_get_unchecked::<Vec<Option<bool>>, _>(idx).map(|v| json!(v)),
        "INT2[]" => row.try_get_unchecked::<Vec<Option<i16>>, _>(idx).map(|v| json!(v)),
        "INT4[]" => row.try_get_unchecked::<Vec<Option<i32>>, _>(idx).map(|v| json!(v)),
        "INT8[]" => row.try_get_unchecked::<Vec<Option<i64>>, _>(idx).map(|v| json!(v)),
        "FLOAT4[]" => row.try_get_unchecked::<Vec<Option<f32>>, _>(idx).map(|v| {
            Value::Array(v.into_iter().map(|f| f.map_or(Value::Null, f32_to_json)).collect())
        }),
        "FLOAT8[]" => row.try_get_unchecked::<Vec<Option<f64>>, _>(idx).map(|v| json!(v)),
        "NUMERIC[]" => row
            .try_get_unchecked::<Vec<Option<Decimal>>, _>(idx)
            .map(|v| json!(v.into_iter().map(|d| d.map(|d| d.to_string())).collect::<Vec<_>>())),
        "UUID[]" => row
            .try_get_unchecked::<Vec<Option<Uuid>>, _>(idx)
            .map(|v| json!(v.into_iter().map(|u| u.map(|u| u.to_string())).collect::<Vec<_>>())),
        t if pg_is_text_like(t) => row.try_get_unchecked::<String, _>(idx).map(Value::String),
        _ => {
            backend_warn(format!(
                "No JSON conversion for PostgreSQL column {} ({}); returning null",
                idx, type_name
            ));
            return Value::Null;
        }
    };

    pg_decoded(decoded, idx, type_name)
}

fn pg_decoded(decoded: Result<Value, sqlx::Error>, idx: usize, type_name: &str) -> Value {
    decoded.unwrap_or_else(|err| {
        backend_warn(format!("Cannot decode PostgreSQL column {} ({}): {}", idx, type_name, err));
        Value::Null
    })
}

/// Shortest decimal form, so a FLOAT holding 0.1 renders as 0.1.
fn f32_to_json(f: f32) -> Value {
    f.to_string()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn interval_to_json(interval: &PgInterval) -> Value {
    json!({
        "months": interval.months,
        "days": interval.days,
        "microseconds": interval.microseconds,
    })
}
