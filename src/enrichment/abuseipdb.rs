//! AbuseIPDB reputation provider

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::credentials::Credentials;
use crate::enrichment::{EnrichmentProvider, ProviderError};

const ABUSEIPDB_API_URL: &str = "https://api.abuseipdb.com/api/v2";
const MAX_AGE_IN_DAYS: &str = "90";

/// AbuseIPDB API response
#[derive(Debug, Default, Deserialize)]
struct AbuseIpDbResponse {
    #[serde(default)]
    data: AbuseIpDbData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AbuseIpDbData {
    is_public: Option<bool>,
    is_whitelisted: Option<bool>,
    abuse_confidence_score: i64,
    country_code: Option<String>,
    usage_type: Option<String>,
    isp: Option<String>,
    domain: Option<String>,
    total_reports: i64,
    num_distinct_users: i64,
    last_reported_at: Option<String>,
}

/// AbuseIPDB enrichment provider
pub struct AbuseIpDbProvider {
    client: Client,
    credentials: Arc<Credentials>,
    base_url: String,
}

impl AbuseIpDbProvider {
    /// Create a new AbuseIPDB provider
    pub fn new(credentials: Arc<Credentials>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            credentials,
            base_url: ABUSEIPDB_API_URL.to_string(),
        }
    }

    /// Point the provider at another API root (mirrors, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn check_ip(&self, ip: &str, api_key: &str) -> Result<AbuseIpDbData, ProviderError> {
        let response = self
            .client
            .get(format!("{}/check", self.base_url))
            .header("Key", api_key)
            .header("Accept", "application/json")
            .query(&[("ipAddress", ip), ("maxAgeInDays", MAX_AGE_IN_DAYS)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let body = response.text().await?;
        let parsed: AbuseIpDbResponse =
            serde_json::from_str(&body).map_err(ProviderError::Malformed)?;

        Ok(parsed.data)
    }
}

#[async_trait]
impl EnrichmentProvider for AbuseIpDbProvider {
    fn name(&self) -> &'static str {
        "abuseipdb"
    }

    fn enrichment_type(&self) -> &'static str {
        "reputation"
    }

    async fn lookup(&self, ip: &str) -> Result<Value, ProviderError> {
        let api_key = self
            .credentials
            .get(self.name())
            .ok_or(ProviderError::MissingCredentials)?;

        let data = self.check_ip(ip, api_key).await?;

        Ok(json!({
            "abuse_confidence_score": data.abuse_confidence_score,
            "country_code": data.country_code,
            "usage_type": data.usage_type,
            "isp": data.isp,
            "domain": data.domain,
            "total_reports": data.total_reports,
            "num_distinct_users": data.num_distinct_users,
            "last_reported_at": data.last_reported_at,
            "is_whitelisted": data.is_whitelisted,
            "is_public": data.is_public,
        }))
    }
}
