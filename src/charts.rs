//! charts.rs — forwards tabular results to the chart-image service.
//! The service answers with a ZIP of PNG charts plus a text summary; the
//! archive is relayed untouched.

use serde_json::Value;

use crate::error::ApiError;
use crate::logging::{backend_error, backend_info, truncate_for_log};

pub struct ChartArchive {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Charts need a non-empty array of row objects.
pub fn validate_chart_data(data: &Value) -> Result<(), ApiError> {
    match data.as_array() {
        Some(rows) if rows.first().is_some_and(Value::is_object) => Ok(()),
        _ => Err(ApiError::BadRequest("Invalid data format.".into())),
    }
}

pub async fn generate_charts(
    http: &reqwest::Client,
    service_url: &str,
    data: &Value,
) -> Result<ChartArchive, ApiError> {
    validate_chart_data(data)?;
    backend_info(format!(
        "Requesting charts for {} rows from {}",
        data.as_array().map_or(0, Vec::len),
        service_url
    ));

    let resp = http
        .post(service_url)
        .json(&serde_json::json!({ "data": data }))
        .send()
        .await
        .map_err(|e| {
            backend_error(format!("Chart service request failed: {}", e));
            ApiError::Upstream("Failed to fetch ZIP file.".into())
        })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        backend_error(format!(
            "Chart service HTTP {}: {}",
            status,
            truncate_for_log(&body, 300)
        ));
        return Err(ApiError::Upstream("Failed to fetch ZIP file.".into()));
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/zip")
        .to_string();

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ApiError::Upstream(format!("Failed to read chart archive: {e}")))?;

    backend_info(format!("Chart archive received ({} bytes)", bytes.len()));
    Ok(ChartArchive {
        content_type,
        bytes: bytes.to_vec(),
    })
}
