//! sql_guard.rs — screening of SQL before it reaches the user's database.
//!
//! Three layers: a local regex pre-filter for classic injection shapes, a
//! list of destructive keywords that need explicit confirmation, and an
//! optional hosted classifier consulted when the pre-filter passes.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::logging::{backend_info, backend_warn, truncate_for_log};

lazy_static! {
    static ref INJECTION_PATTERNS: Vec<(&'static str, Regex)> = vec![
        (
            "tautology",
            Regex::new(r"(?i)'\s*or\s+('[^']*'|\d+)\s*=\s*('[^']*'|\d+)").unwrap(),
        ),
        ("tautology", Regex::new(r"(?i)\bor\s+1\s*=\s*1\b").unwrap()),
        (
            "stacked statement",
            Regex::new(r"(?i);\s*(drop|delete|truncate|alter|shutdown|exec|execute)\b").unwrap(),
        ),
        ("union injection", Regex::new(r"(?i)'\s*\)?\s*union\s+(all\s+)?select\b").unwrap()),
        ("comment terminator", Regex::new(r"'\s*(--|#|/\*)").unwrap()),
        ("time-based probe", Regex::new(r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(").unwrap()),
        ("time-based probe", Regex::new(r"(?i)\bwaitfor\s+delay\b").unwrap()),
        ("server escape", Regex::new(r"(?i)\bxp_cmdshell\b").unwrap()),
        ("file access", Regex::new(r"(?i)\bload_file\s*\(").unwrap()),
        ("file access", Regex::new(r"(?i)\binto\s+(out|dump)file\b").unwrap()),
    ];
    static ref SENSITIVE: Regex = Regex::new(
        r"(?i)\b(DROP|DELETE|TRUNCATE|ALTER|UPDATE|INSERT|GRANT|REVOKE|CREATE|RENAME|REPLACE)\b"
    )
    .unwrap();
    static ref STRING_LITERAL: Regex = Regex::new(r#"'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.)*""#).unwrap();
}

/// Name of the first injection pattern `query` matches, if any.
/// Patterns run against the query with every string literal emptied, so
/// literal contents such as `'#ff0000'` never look like SQL.
pub fn prefilter(query: &str) -> Option<&'static str> {
    let shape = STRING_LITERAL.replace_all(query, "''");
    INJECTION_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(&shape))
        .map(|(name, _)| *name)
}

/// Destructive keywords present outside string literals, uppercased, in
/// first-seen order without repeats.
pub fn sensitive_keywords(query: &str) -> Vec<String> {
    let without_literals = STRING_LITERAL.replace_all(query, "''");
    let mut found: Vec<String> = Vec::new();
    for m in SENSITIVE.find_iter(&without_literals) {
        let kw = m.as_str().to_uppercase();
        if !found.contains(&kw) {
            found.push(kw);
        }
    }
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardSource {
    Prefilter,
    Classifier,
    None,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardReport {
    pub is_malicious: bool,
    pub message: String,
    pub source: GuardSource,
    pub sensitive_keywords: Vec<String>,
    pub requires_confirmation: bool,
}

impl GuardReport {
    /// Turn the report into an admission decision for execution.
    pub fn admit(&self, confirmed: bool) -> Result<(), ApiError> {
        if self.is_malicious {
            return Err(ApiError::MaliciousQuery);
        }
        if self.requires_confirmation && !confirmed {
            return Err(ApiError::ConfirmationRequired(self.sensitive_keywords.clone()));
        }
        Ok(())
    }
}

/// Local checks only.
pub fn local_report(query: &str) -> GuardReport {
    let sensitive = sensitive_keywords(query);
    let requires_confirmation = !sensitive.is_empty();

    if let Some(pattern) = prefilter(query) {
        return GuardReport {
            is_malicious: true,
            message: format!("Query blocked by pre-filter ({pattern})"),
            source: GuardSource::Prefilter,
            sensitive_keywords: sensitive,
            requires_confirmation,
        };
    }

    GuardReport {
        is_malicious: false,
        message: if requires_confirmation {
            format!("Query modifies data or schema ({})", sensitive.join(", "))
        } else {
            "Query looks safe".to_string()
        },
        source: GuardSource::None,
        sensitive_keywords: sensitive,
        requires_confirmation,
    }
}

#[derive(Debug, Deserialize)]
struct ClassifierVerdict {
    #[serde(alias = "isMalicious", alias = "malicious")]
    is_malicious: bool,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Client for the hosted SQL-injection classifier.
#[derive(Clone)]
pub struct Classifier {
    http: reqwest::Client,
    url: String,
    default_model: String,
}

impl Classifier {
    pub fn new(http: reqwest::Client, url: &str, default_model: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
            default_model: default_model.to_string(),
        }
    }

    /// Returns `(is_malicious, confidence)`.
    pub async fn classify(&self, query: &str, model: Option<&str>) -> Result<(bool, Option<f64>), ApiError> {
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());

        let resp = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "query": query, "model": model }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "Classifier HTTP {}: {}",
                status,
                truncate_for_log(&body, 200)
            )));
        }

        let verdict: ClassifierVerdict = resp
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("Classifier JSON parse error: {e}")))?;
        Ok((verdict.is_malicious, verdict.confidence))
    }
}

/// Full screening: pre-filter first, then the classifier when configured.
/// A classifier outage does not block the query; the local verdict stands.
pub async fn check(query: &str, classifier: Option<&Classifier>, model: Option<&str>) -> GuardReport {
    let mut report = local_report(query);
    if report.is_malicious {
        backend_warn(format!("Pre-filter blocked query: {}", truncate_for_log(query, 120)));
        return report;
    }

    let Some(classifier) = classifier else {
        return report;
    };

    match classifier.classify(query, model).await {
        Ok((true, confidence)) => {
            backend_warn(format!(
                "Classifier flagged query (confidence={:?}): {}",
                confidence,
                truncate_for_log(query, 120)
            ));
            report.is_malicious = true;
            report.source = GuardSource::Classifier;
            report.message = match confidence {
                Some(c) => format!("Query flagged as malicious by classifier ({:.0}% confidence)", c * 100.0),
                None => "Query flagged as malicious by classifier".to_string(),
            };
        }
        Ok((false, _)) => {
            backend_info("Classifier marked query as safe");
            report.source = GuardSource::Classifier;
        }
        Err(err) => {
            backend_warn(format!("Classifier unavailable, using local checks only: {}", err));
        }
    }
    report
}
