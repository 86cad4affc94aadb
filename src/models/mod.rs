//! Core data models for IP triage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// API request to triage an IP address
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct TriageRequest {
    #[validate(length(min = 1, max = 255))]
    pub ip: Option<String>,
}

impl TriageRequest {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: Some(ip.into()) }
    }
}

/// Successful triage outcome
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TriageResult {
    #[serde(skip_serializing)]
    pub ip: String,
    pub message: String,
    pub report: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentReport>,
}

impl TriageResult {
    pub fn new(ip: &str, report: impl Into<String>) -> Self {
        Self {
            ip: ip.to_string(),
            message: format!("Playbook successfully executed for IP: {}", ip),
            report: report.into(),
            enrichment: None,
        }
    }
}

/// Outcome of a single provider lookup
///
/// Always produced, even when the lookup failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderResult {
    pub provider: String,
    pub ok: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ProviderResult {
    pub fn success(provider: &str, data: Value) -> Self {
        Self {
            provider: provider.to_string(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(provider: &str, error: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Render the way the lookup command prints it: the data mapping, or `{"error": ...}`
    pub fn to_lookup_json(&self) -> Value {
        match (&self.data, &self.error) {
            (Some(data), _) if self.ok => data.clone(),
            (_, Some(error)) => serde_json::json!({ "error": error }),
            _ => serde_json::json!({ "error": "no data returned" }),
        }
    }
}

/// Combined enrichment for one IP, one slot per configured provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentReport {
    pub ip: String,
    pub generated_at: DateTime<Utc>,
    pub results: Vec<ProviderResult>,
}

impl EnrichmentReport {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }

    /// True when every provider returned data
    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }
}
