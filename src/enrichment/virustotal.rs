//! VirusTotal malware-scan provider

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::credentials::Credentials;
use crate::enrichment::{EnrichmentProvider, ProviderError};

const VT_API_URL: &str = "https://www.virustotal.com/api/v3";

/// Free API tier allows 4 lookups per minute
const VT_PACING: Duration = Duration::from_secs(1);

/// VirusTotal analysis stats
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VtAnalysisStats {
    malicious: i64,
    suspicious: i64,
    harmless: i64,
    undetected: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VtAttributes {
    last_analysis_stats: VtAnalysisStats,
    as_owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VtData {
    attributes: VtAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VtResponse {
    data: VtData,
}

/// VirusTotal enrichment provider
pub struct VirusTotalProvider {
    client: Client,
    credentials: Arc<Credentials>,
    base_url: String,
    pacing: Duration,
}

impl VirusTotalProvider {
    /// Create a new VirusTotal provider
    pub fn new(credentials: Arc<Credentials>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            credentials,
            base_url: VT_API_URL.to_string(),
            pacing: VT_PACING,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the delay between lookups (premium keys, tests)
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// `<base>/ip_addresses/<ip>`, with the IP encoded as a single path segment
    fn endpoint(&self, ip: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::InvalidBaseUrl(format!("{}: {}", self.base_url, e)))?;

        url.path_segments_mut()
            .map_err(|_| ProviderError::InvalidBaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push("ip_addresses")
            .push(ip);

        Ok(url)
    }

    async fn fetch(&self, ip: &str, api_key: &str) -> Result<VtAttributes, ProviderError> {
        let response = self
            .client
            .get(self.endpoint(ip)?)
            .header("x-apikey", api_key)
            .header("accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let body = response.text().await?;
        let parsed: VtResponse = serde_json::from_str(&body).map_err(ProviderError::Malformed)?;

        Ok(parsed.data.attributes)
    }
}

#[async_trait]
impl EnrichmentProvider for VirusTotalProvider {
    fn name(&self) -> &'static str {
        "virustotal"
    }

    fn enrichment_type(&self) -> &'static str {
        "malware_scan"
    }

    fn pacing(&self) -> Duration {
        self.pacing
    }

    async fn lookup(&self, ip: &str) -> Result<Value, ProviderError> {
        let api_key = self
            .credentials
            .get(self.name())
            .ok_or(ProviderError::MissingCredentials)?;

        let attrs = self.fetch(ip, api_key).await?;
        let stats = &attrs.last_analysis_stats;

        Ok(json!({
            "as_owner": attrs.as_owner.as_deref().unwrap_or("N/A"),
            "harmless": stats.harmless,
            "malicious": stats.malicious,
            "suspicious": stats.suspicious,
            "undetected": stats.undetected,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> VirusTotalProvider {
        let credentials = Credentials::parse("virustotal_key: vt-secret");
        VirusTotalProvider::new(Arc::new(credentials))
            .with_base_url(server.uri())
            .with_pacing(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_check_normalizes_stats() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip_addresses/8.8.8.8"))
            .and(header("x-apikey", "vt-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "8.8.8.8",
                    "type": "ip_address",
                    "attributes": {
                        "as_owner": "GOOGLE",
                        "asn": 15169,
                        "last_analysis_stats": {
                            "harmless": 62,
                            "malicious": 1,
                            "suspicious": 0,
                            "undetected": 23,
                            "timeout": 0
                        }
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server).check("8.8.8.8").await;

        assert!(result.ok, "{:?}", result.error);
        assert_eq!(
            result.data,
            Some(json!({
                "as_owner": "GOOGLE",
                "harmless": 62,
                "malicious": 1,
                "suspicious": 0,
                "undetected": 23,
            }))
        );
    }

    #[tokio::test]
    async fn test_absent_fields_use_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip_addresses/192.0.2.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
            .mount(&server)
            .await;

        let result = provider(&server).check("192.0.2.1").await;

        assert_eq!(
            result.data,
            Some(json!({
                "as_owner": "N/A",
                "harmless": 0,
                "malicious": 0,
                "suspicious": 0,
                "undetected": 0,
            }))
        );
    }

    #[tokio::test]
    async fn test_not_found_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("NotFoundError"))
            .mount(&server)
            .await;

        let result = provider(&server).check("192.0.2.1").await;

        assert!(!result.ok);
        assert!(result.data.is_none());
        assert!(result.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_ip_stays_inside_ip_addresses_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = VirusTotalProvider::new(Arc::new(Credentials::parse("virustotal_key: k")))
            .with_base_url(format!("{}/api/v3", server.uri()))
            .with_pacing(Duration::ZERO);

        provider.check("../x").await;
        provider.check("../../users/me").await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            let path = request.url.path();
            assert!(path.starts_with("/api/v3/ip_addresses/"), "escaped to {path}");
            assert_eq!(path.matches('/').count(), 4, "ip split into segments: {path}");
        }
    }

    #[tokio::test]
    async fn test_invalid_base_url_is_failure() {
        let provider = VirusTotalProvider::new(Arc::new(Credentials::parse("virustotal_key: k")))
            .with_base_url("not a url")
            .with_pacing(Duration::ZERO);

        let result = provider.check("8.8.8.8").await;

        assert!(!result.ok);
        assert!(result.error.unwrap().starts_with("Invalid API base URL"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_failure() {
        let provider = VirusTotalProvider::new(Arc::new(Credentials::parse("virustotal_key: k")))
            .with_base_url("http://127.0.0.1:1")
            .with_pacing(Duration::ZERO);

        let result = provider.check("8.8.8.8").await;

        assert!(!result.ok);
        assert!(result.data.is_none());
        assert!(result.error.unwrap().starts_with("API request failed:"));
    }

    #[tokio::test]
    async fn test_default_pacing_delays_return() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
            .mount(&server)
            .await;

        let provider = VirusTotalProvider::new(Arc::new(Credentials::parse("virustotal_key: k")))
            .with_base_url(server.uri());
        assert_eq!(provider.pacing(), VT_PACING);

        let start = Instant::now();
        assert!(provider.check("192.0.2.1").await.ok);
        assert!(start.elapsed() >= VT_PACING);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_not_paced() {
        let provider = VirusTotalProvider::new(Arc::new(Credentials::default()));

        let start = Instant::now();
        let result = provider.check("192.0.2.1").await;

        assert_eq!(result.error.as_deref(), Some("missing credentials"));
        assert!(start.elapsed() < VT_PACING);
    }
}
