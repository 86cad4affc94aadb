//! Triage orchestration
//!
//! One request in, exactly one `TriageResult` or `TriageError` out.

use std::net::IpAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use validator::Validate;

use crate::enrichment::EnrichmentAggregator;
use crate::models::{TriageRequest, TriageResult};
use crate::playbook::{ExecutionError, PlaybookRunner};

/// Self-test address: exercises the pipeline without spawning anything
pub const DIAGNOSTIC_IP: &str = "127.0.0.1";
const DIAGNOSTIC_REPORT: &str = "There's no place like home. It's safe here.";

const MISSING_IP: &str = "Missing 'ip' in request body";

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("{0}")]
    Validation(String),

    #[error("Playbook execution failed for IP: {ip}")]
    Playbook {
        ip: String,
        #[source]
        source: ExecutionError,
    },
}

impl TriageError {
    pub fn kind(&self) -> &'static str {
        match self {
            TriageError::Validation(_) => "validation_error",
            TriageError::Playbook { .. } => "playbook_execution_error",
        }
    }

    pub fn ip(&self) -> Option<&str> {
        match self {
            TriageError::Validation(_) => None,
            TriageError::Playbook { ip, .. } => Some(ip),
        }
    }

    /// Caller-facing message
    pub fn error(&self) -> String {
        match self {
            TriageError::Playbook {
                source: source @ ExecutionError::NotFound { .. },
                ..
            } => source.to_string(),
            other => other.to_string(),
        }
    }

    /// Diagnostic output from the job, if any
    pub fn detail(&self) -> Option<String> {
        match self {
            TriageError::Validation(_) => None,
            TriageError::Playbook { source, .. } => source.detail(),
        }
    }

    /// `{"error": ..., "playbook_error"?: ...}`
    pub fn to_json(&self) -> Value {
        let mut body = json!({ "error": self.error() });
        if let Some(detail) = self.detail() {
            body["playbook_error"] = json!(detail);
        }
        body
    }
}

/// Drives the playbook (and optionally enrichment) for one IP
pub struct TriageOrchestrator {
    runner: Arc<dyn PlaybookRunner>,
    enrichment: Option<Arc<EnrichmentAggregator>>,
}

impl TriageOrchestrator {
    pub fn new(runner: Arc<dyn PlaybookRunner>) -> Self {
        Self {
            runner,
            enrichment: None,
        }
    }

    /// Attach an enrichment report to every successful triage
    pub fn with_enrichment(mut self, aggregator: Arc<EnrichmentAggregator>) -> Self {
        self.enrichment = Some(aggregator);
        self
    }

    pub async fn triage(&self, request: TriageRequest) -> Result<TriageResult, TriageError> {
        let ip = validate(&request)?;

        if ip == DIAGNOSTIC_IP {
            tracing::info!(ip = %ip, "Diagnostic address, skipping playbook");
            return Ok(TriageResult::new(ip, DIAGNOSTIC_REPORT));
        }

        if ip.parse::<IpAddr>().is_err() {
            tracing::warn!(ip = %ip, "Value does not look like an IP address, passing it to the playbook anyway");
        }

        let playbook = async {
            let artifact = self.runner.run(ip).await?;
            artifact.read().await
        };

        let (outcome, enrichment) = match &self.enrichment {
            Some(aggregator) => {
                let (outcome, report) = tokio::join!(playbook, aggregator.enrich(ip));
                (outcome, Some(report))
            }
            None => (playbook.await, None),
        };

        match outcome {
            Ok(report) => {
                tracing::info!(ip = %ip, bytes = report.len(), "Triage complete");
                let mut result = TriageResult::new(ip, report);
                result.enrichment = enrichment;
                Ok(result)
            }
            Err(source) => {
                tracing::error!(ip = %ip, error = %source, "Triage failed");
                Err(TriageError::Playbook {
                    ip: ip.to_string(),
                    source,
                })
            }
        }
    }
}

fn validate(request: &TriageRequest) -> Result<&str, TriageError> {
    let ip = request
        .ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| TriageError::Validation(MISSING_IP.to_string()))?;

    request
        .validate()
        .map_err(|_| TriageError::Validation("Invalid 'ip' in request body".to_string()))?;

    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::playbook::{MockPlaybookRunner, ReportArtifact};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn report_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    fn orchestrator(runner: MockPlaybookRunner) -> TriageOrchestrator {
        TriageOrchestrator::new(Arc::new(runner))
    }

    #[tokio::test]
    async fn test_diagnostic_ip_never_runs_playbook() {
        let mut runner = MockPlaybookRunner::new();
        runner.expect_run().times(0);
        let triage = orchestrator(runner);

        for _ in 0..2 {
            let result = assert_ok!(triage.triage(TriageRequest::new("127.0.0.1")).await);
            assert_eq!(result.message, "Playbook successfully executed for IP: 127.0.0.1");
            assert_eq!(result.report, "There's no place like home. It's safe here.");
            assert!(result.enrichment.is_none());
        }
    }

    #[tokio::test]
    async fn test_missing_or_blank_ip_is_validation_error() {
        let mut runner = MockPlaybookRunner::new();
        runner.expect_run().times(0);
        let triage = orchestrator(runner);

        for request in [TriageRequest::default(), TriageRequest::new(""), TriageRequest::new("   ")] {
            let err = assert_err!(triage.triage(request).await);
            assert_eq!(err.kind(), "validation_error");
            assert_eq!(err.to_json(), json!({ "error": "Missing 'ip' in request body" }));
        }
    }

    #[tokio::test]
    async fn test_oversized_ip_is_rejected() {
        let mut runner = MockPlaybookRunner::new();
        runner.expect_run().times(0);

        let err = assert_err!(orchestrator(runner).triage(TriageRequest::new("1".repeat(300))).await);
        assert!(matches!(err, TriageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_success_reads_report_artifact() {
        let report = report_file("OK");
        let path = report.path().to_path_buf();

        let mut runner = MockPlaybookRunner::new();
        runner
            .expect_run()
            .withf(|ip: &str| ip == "8.8.8.8")
            .times(1)
            .returning(move |_| Ok(ReportArtifact::new(path.clone())));

        let result = assert_ok!(orchestrator(runner).triage(TriageRequest::new("8.8.8.8")).await);

        assert_eq!(result.ip, "8.8.8.8");
        assert_eq!(result.message, "Playbook successfully executed for IP: 8.8.8.8");
        assert_eq!(result.report, "OK");
    }

    #[tokio::test]
    async fn test_non_zero_exit_surfaces_diagnostic() {
        let mut runner = MockPlaybookRunner::new();
        runner.expect_run().times(1).returning(|_| {
            Err(ExecutionError::NonZeroExit {
                code: Some(1),
                detail: "boom".into(),
            })
        });

        let err = assert_err!(orchestrator(runner).triage(TriageRequest::new("8.8.8.8")).await);

        assert_eq!(err.kind(), "playbook_execution_error");
        assert_eq!(err.ip(), Some("8.8.8.8"));
        assert_eq!(
            err.to_json(),
            json!({
                "error": "Playbook execution failed for IP: 8.8.8.8",
                "playbook_error": "boom",
            })
        );
    }

    #[tokio::test]
    async fn test_missing_executable_message() {
        let mut runner = MockPlaybookRunner::new();
        runner.expect_run().returning(|_| {
            Err(ExecutionError::NotFound {
                program: "ansible-playbook".into(),
            })
        });

        let err = assert_err!(orchestrator(runner).triage(TriageRequest::new("8.8.8.8")).await);
        assert_eq!(err.to_json(), json!({ "error": "ansible-playbook command not found." }));
    }

    #[tokio::test]
    async fn test_missing_report_after_success_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("report.md");

        let mut runner = MockPlaybookRunner::new();
        runner
            .expect_run()
            .returning(move |_| Ok(ReportArtifact::new(missing.clone())));

        let err = assert_err!(orchestrator(runner).triage(TriageRequest::new("8.8.8.8")).await);
        assert_eq!(err.error(), "Playbook execution failed for IP: 8.8.8.8");
        assert!(err.detail().unwrap().starts_with("Report artifact unavailable"));
    }

    #[tokio::test]
    async fn test_implausible_ip_still_reaches_playbook() {
        let report = report_file("checked");
        let path = report.path().to_path_buf();

        let mut runner = MockPlaybookRunner::new();
        runner
            .expect_run()
            .withf(|ip: &str| ip == "not-an-ip")
            .times(1)
            .returning(move |_| Ok(ReportArtifact::new(path.clone())));

        let result = assert_ok!(orchestrator(runner).triage(TriageRequest::new("not-an-ip")).await);
        assert_eq!(result.report, "checked");
    }

    #[tokio::test]
    async fn test_enrichment_attached_on_success() {
        let report = report_file("OK");
        let path = report.path().to_path_buf();

        let mut runner = MockPlaybookRunner::new();
        runner
            .expect_run()
            .returning(move |_| Ok(ReportArtifact::new(path.clone())));

        let aggregator = EnrichmentAggregator::with_default_providers(Arc::new(Credentials::default()));
        let triage = orchestrator(runner).with_enrichment(Arc::new(aggregator));

        let result = assert_ok!(triage.triage(TriageRequest::new("8.8.8.8")).await);

        let enrichment = result.enrichment.unwrap();
        assert_eq!(enrichment.ip, "8.8.8.8");
        assert_eq!(enrichment.results.len(), 2);
        assert_eq!(enrichment.failed_count(), 2);
    }
}
