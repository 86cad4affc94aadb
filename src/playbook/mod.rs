//! Automation playbook invocation
//!
//! The job is an opaque external program. The runner only observes its exit
//! status and the report file it leaves behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{program} command not found.")]
    NotFound { program: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Playbook exited with status {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    NonZeroExit { code: Option<i32>, detail: String },

    #[error("Playbook timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Report artifact unavailable at {}: {source}", .path.display())]
    ReportUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ExecutionError {
    /// Diagnostic text for the caller, if the job produced any
    pub fn detail(&self) -> Option<String> {
        match self {
            ExecutionError::NotFound { .. } => None,
            ExecutionError::NonZeroExit { detail, .. } => Some(detail.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Handle to the report file written by the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
    pub path: PathBuf,
    /// Remove the file once read
    pub ephemeral: bool,
}

impl ReportArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ephemeral: false,
        }
    }

    /// Read the report as UTF-8 text
    pub async fn read(&self) -> Result<String, ExecutionError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ExecutionError::ReportUnavailable {
                path: self.path.clone(),
                source,
            })?;

        if self.ephemeral {
            self.discard().await;
        }

        Ok(content)
    }

    /// Best-effort removal of whatever the job left at the report path
    pub async fn discard(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove report artifact");
            }
        }
    }
}

/// Runs the automation job for one IP
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(&self, ip: &str) -> Result<ReportArtifact, ExecutionError>;
}

/// Where the job writes its report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportLocation {
    /// One shared path, resolved against the job's working directory
    Fixed(PathBuf),
    /// A fresh file per run, handed to the job as `report_path`
    PerRequest { dir: PathBuf },
}

impl Default for ReportLocation {
    fn default() -> Self {
        ReportLocation::Fixed(PathBuf::from("report.md"))
    }
}

/// Environment variable carrying the IP to the job
///
/// Environment lookups come back marked unsafe in Ansible, so the value is
/// never re-templated, unlike `ip_to_check` from `--extra-vars`.
pub const IP_ENV_VAR: &str = "TRIAGE_IP";

/// Invokes `ansible-playbook <playbook> --extra-vars <json>`
#[derive(Debug, Clone)]
pub struct AnsiblePlaybookRunner {
    program: String,
    playbook: PathBuf,
    report: ReportLocation,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl AnsiblePlaybookRunner {
    pub fn new(program: impl Into<String>, playbook: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            playbook: playbook.into(),
            report: ReportLocation::default(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn with_report_location(mut self, report: ReportLocation) -> Self {
        self.report = report;
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Pick the artifact for this run and build the extra-vars argument
    ///
    /// The IP travels as a JSON string value inside a single argv element.
    fn prepare(&self, ip: &str) -> (ReportArtifact, String) {
        match &self.report {
            ReportLocation::Fixed(path) => {
                let vars = json!({ "ip_to_check": ip });
                (ReportArtifact::new(self.resolve(path)), vars.to_string())
            }
            ReportLocation::PerRequest { dir } => {
                let path = self.resolve(dir).join(format!("{}.md", Uuid::new_v4()));
                let vars = json!({
                    "ip_to_check": ip,
                    "report_path": path.to_string_lossy(),
                });
                let artifact = ReportArtifact {
                    path,
                    ephemeral: true,
                };
                (artifact, vars.to_string())
            }
        }
    }

    fn command(&self, ip: &str, extra_vars: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.playbook)
            .arg("--extra-vars")
            .arg(extra_vars)
            .env(IP_ENV_VAR, ip)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd
    }

    /// Spawn the job and wait for it, mapping every failure mode
    async fn execute(&self, ip: &str, extra_vars: &str) -> Result<(), ExecutionError> {
        let child = self.command(ip, extra_vars).spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::NotFound {
                    program: self.program.clone(),
                }
            } else {
                ExecutionError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            }
        })?;

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExecutionError::Timeout(limit))?,
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|source| ExecutionError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout)
            } else {
                stderr
            };

            tracing::warn!(ip = %ip, status = ?output.status.code(), "Playbook failed");

            return Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                detail: diagnostic.trim_end().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl PlaybookRunner for AnsiblePlaybookRunner {
    async fn run(&self, ip: &str) -> Result<ReportArtifact, ExecutionError> {
        let (artifact, extra_vars) = self.prepare(ip);

        tracing::info!(
            ip = %ip,
            program = %self.program,
            playbook = %self.playbook.display(),
            "Running playbook"
        );

        if let Err(e) = self.execute(ip, &extra_vars).await {
            // A failed job may still have written part of a per-request report
            if artifact.ephemeral {
                artifact.discard().await;
            }
            return Err(e);
        }

        tracing::debug!(ip = %ip, report = %artifact.path.display(), "Playbook finished");
        Ok(artifact)
    }
}
