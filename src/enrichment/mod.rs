//! Enrichment services for IP triage

pub mod abuseipdb;
pub mod virustotal;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::credentials::Credentials;
use crate::models::{EnrichmentReport, ProviderResult};

use abuseipdb::AbuseIpDbProvider;
use virustotal::VirusTotalProvider;

/// Failure of a single provider lookup
///
/// Never leaves the provider: `check` turns it into a `ProviderResult`.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("Invalid API base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API request failed: {status} - {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Failed to decode JSON response from API.")]
    Malformed(#[source] serde_json::Error),
}

/// Trait for enrichment providers
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Provider name, also the credentials key
    fn name(&self) -> &'static str;

    /// Enrichment type (reputation, malware_scan, ...)
    fn enrichment_type(&self) -> &'static str;

    /// Minimum delay after each issued request, for rate-limited backends
    fn pacing(&self) -> Duration {
        Duration::ZERO
    }

    /// Query the backend and normalize its response
    async fn lookup(&self, ip: &str) -> Result<Value, ProviderError>;

    /// Perform the lookup, folding every failure into the result
    async fn check(&self, ip: &str) -> ProviderResult {
        let outcome = self.lookup(ip).await;

        if !matches!(outcome, Err(ProviderError::MissingCredentials)) && !self.pacing().is_zero() {
            tokio::time::sleep(self.pacing()).await;
        }

        match outcome {
            Ok(data) => ProviderResult::success(self.name(), data),
            Err(e) => {
                tracing::warn!(
                    provider = self.name(),
                    kind = self.enrichment_type(),
                    ip = %ip,
                    error = %e,
                    "Enrichment failed"
                );
                ProviderResult::failure(self.name(), e.to_string())
            }
        }
    }
}

/// Fans a lookup out to every configured provider
pub struct EnrichmentAggregator {
    providers: Vec<Box<dyn EnrichmentProvider>>,
}

impl EnrichmentAggregator {
    pub fn new() -> Self {
        Self { providers: vec![] }
    }

    /// Reputation first, then malware scan
    pub fn with_default_providers(credentials: Arc<Credentials>) -> Self {
        let mut aggregator = Self::new();
        aggregator.add_provider(Box::new(AbuseIpDbProvider::new(credentials.clone())));
        aggregator.add_provider(Box::new(VirusTotalProvider::new(credentials)));
        aggregator
    }

    pub fn add_provider(&mut self, provider: Box<dyn EnrichmentProvider>) {
        self.providers.push(provider);
    }

    pub fn provider(&self, name: &str) -> Option<&dyn EnrichmentProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Enrich an IP with all providers
    ///
    /// Lookups run concurrently; results keep configuration order.
    pub async fn enrich(&self, ip: &str) -> EnrichmentReport {
        let lookups = self.providers.iter().map(|provider| async move {
            match AssertUnwindSafe(provider.check(ip)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(provider = provider.name(), ip = %ip, "Enrichment provider panicked");
                    ProviderResult::failure(provider.name(), "provider panicked")
                }
            }
        });

        let results = join_all(lookups).await;

        let report = EnrichmentReport {
            ip: ip.to_string(),
            generated_at: Utc::now(),
            results,
        };

        tracing::info!(
            ip = %ip,
            providers = report.results.len(),
            failed = report.failed_count(),
            complete = report.is_complete(),
            "Enrichment complete"
        );

        report
    }
}

impl Default for EnrichmentAggregator {
    fn default() -> Self {
        Self::new()
    }
}
