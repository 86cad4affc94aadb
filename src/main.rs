//! TriageForge
//!
//! Runs an automation playbook against an IP address, returns its report,
//! and enriches IPs with threat-intelligence lookups.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod credentials;
mod enrichment;
mod models;
mod playbook;
mod triage;

use api::{create_router, AppState};
use credentials::{Credentials, CredentialsError};
use enrichment::EnrichmentAggregator;
use models::TriageRequest;
use playbook::{AnsiblePlaybookRunner, ReportLocation};
use triage::TriageOrchestrator;

/// TriageForge
#[derive(Parser, Debug)]
#[command(name = "triageforge")]
#[command(about = "Run triage playbooks and enrich IP addresses")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Server host
    #[arg(long, env = "HOST", default_value = "0.0.0.0", global = true)]
    host: String,

    /// Server port
    #[arg(long, env = "PORT", default_value = "5000", global = true)]
    port: u16,

    /// Secrets file with `<provider>_key: <value>` lines
    #[arg(long, env = "SECRETS_FILE", default_value = "secrets.yml", global = true)]
    secrets_file: PathBuf,

    /// AbuseIPDB API key (overrides the secrets file)
    #[arg(long, env = "ABUSEIPDB_API_KEY", global = true, hide_env_values = true)]
    abuseipdb_api_key: Option<String>,

    /// VirusTotal API key (overrides the secrets file)
    #[arg(long, env = "VIRUSTOTAL_API_KEY", global = true, hide_env_values = true)]
    virustotal_api_key: Option<String>,

    /// Playbook executable
    #[arg(long, env = "PLAYBOOK_BIN", default_value = "ansible-playbook", global = true)]
    playbook_bin: String,

    /// Playbook file
    #[arg(long, env = "PLAYBOOK_PATH", default_value = "ansible/playbook.yml", global = true)]
    playbook: PathBuf,

    /// Report file written by the playbook
    #[arg(long, env = "REPORT_PATH", default_value = "report.md", global = true)]
    report_path: PathBuf,

    /// Write one report per request into this directory instead of the shared report file
    #[arg(long, env = "REPORT_DIR", global = true)]
    report_dir: Option<PathBuf>,

    /// Working directory for the playbook
    #[arg(long, env = "PLAYBOOK_WORKDIR", global = true)]
    playbook_workdir: Option<PathBuf>,

    /// Kill the playbook after this many seconds
    #[arg(long, env = "PLAYBOOK_TIMEOUT_SECS", global = true)]
    playbook_timeout_secs: Option<u64>,

    /// Attach enrichment results to triage responses
    #[arg(long, env = "TRIAGE_ENRICHMENT", default_value = "false", global = true)]
    triage_enrichment: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,

    /// Triage one IP and print the result
    Triage { ip: String },

    /// Query every enrichment provider for an IP
    Enrich { ip: String },

    /// Query one provider and print a single JSON object
    ///
    /// Exits 1 when the secrets file is missing (and no API key flag or env
    /// var covers the provider), the key is blank, or the provider is unknown.
    Lookup { provider: String, ip: String },
}

impl Args {
    fn with_key_overrides(&self, credentials: Credentials) -> Credentials {
        credentials
            .with_key("abuseipdb", self.abuseipdb_api_key.clone())
            .with_key("virustotal", self.virustotal_api_key.clone())
    }

    /// Credentials for long-running use: a missing file only degrades enrichment
    fn credentials(&self) -> Result<Arc<Credentials>> {
        let credentials = match Credentials::load(&self.secrets_file) {
            Ok(credentials) => credentials,
            Err(e @ CredentialsError::NotFound(_)) => {
                tracing::warn!(error = %e, "Continuing without secrets file");
                Credentials::default()
            }
            Err(e) => return Err(e).context("Failed to load credentials"),
        };

        let credentials = self.with_key_overrides(credentials);
        if credentials.is_empty() {
            tracing::warn!("No provider API keys configured, enrichment will report missing credentials");
        } else {
            tracing::info!(providers = credentials.len(), "Loaded provider credentials");
        }

        Ok(Arc::new(credentials))
    }

    /// Credentials for a one-shot lookup
    ///
    /// A missing secrets file is fatal unless a flag or env key covers the provider.
    fn lookup_credentials(&self, provider: &str) -> Result<Credentials, CredentialsError> {
        match Credentials::load(&self.secrets_file) {
            Ok(credentials) => Ok(self.with_key_overrides(credentials)),
            Err(CredentialsError::NotFound(path)) => {
                let credentials = self.with_key_overrides(Credentials::default());
                if credentials.get(provider).is_some() {
                    Ok(credentials)
                } else {
                    Err(CredentialsError::NotFound(path))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn playbook_runner(&self) -> AnsiblePlaybookRunner {
        let report = match &self.report_dir {
            Some(dir) => ReportLocation::PerRequest { dir: dir.clone() },
            None => ReportLocation::Fixed(self.report_path.clone()),
        };

        AnsiblePlaybookRunner::new(self.playbook_bin.clone(), self.playbook.clone())
            .with_report_location(report)
            .with_working_dir(self.playbook_workdir.clone())
            .with_timeout(self.playbook_timeout_secs.map(Duration::from_secs))
    }

    fn orchestrator(&self, enrichment: &Arc<EnrichmentAggregator>) -> TriageOrchestrator {
        let orchestrator = TriageOrchestrator::new(Arc::new(self.playbook_runner()));
        if self.triage_enrichment {
            orchestrator.with_enrichment(enrichment.clone())
        } else {
            orchestrator
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "triageforge=info,tower_http=info".into());

    // stdout is reserved for command output
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json(value: &Value) {
    println!("{}", value);
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.log_json);

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(&args).await.map(|_| ExitCode::SUCCESS),
        Command::Triage { ip } => run_triage(&args, ip).await,
        Command::Enrich { ip } => run_enrich(&args, &ip).await,
        Command::Lookup { provider, ip } => Ok(run_lookup(&args, &provider, &ip).await),
    }
}

async fn serve(args: &Args) -> Result<()> {
    tracing::info!("Starting TriageForge");

    let enrichment = Arc::new(EnrichmentAggregator::with_default_providers(args.credentials()?));
    tracing::info!(providers = ?enrichment.provider_names(), "Enrichment providers configured");

    // Create application state
    let state = Arc::new(AppState {
        triage: args.orchestrator(&enrichment),
        enrichment,
    });

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("Invalid listen address")?;
    tracing::info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_triage(args: &Args, ip: String) -> Result<ExitCode> {
    let enrichment = Arc::new(EnrichmentAggregator::with_default_providers(args.credentials()?));
    let orchestrator = args.orchestrator(&enrichment);

    match orchestrator.triage(TriageRequest::new(ip)).await {
        Ok(result) => {
            print_json(&serde_json::to_value(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&e.to_json());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_enrich(args: &Args, ip: &str) -> Result<ExitCode> {
    let enrichment = EnrichmentAggregator::with_default_providers(args.credentials()?);
    let report = enrichment.enrich(ip).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

/// Playbook-facing lookup: always one JSON object on stdout
///
/// Provider errors are reported in the payload with exit status 0; only
/// credential problems and unknown providers exit non-zero.
async fn run_lookup(args: &Args, provider: &str, ip: &str) -> ExitCode {
    let outcome = match args.lookup_credentials(provider) {
        Ok(credentials) => {
            let credentials = Arc::new(credentials);
            let enrichment = EnrichmentAggregator::with_default_providers(credentials.clone());
            lookup(&enrichment, &credentials, provider, ip).await
        }
        Err(e) => Err(json!({ "error": e.to_string() })),
    };

    match outcome {
        Ok(output) => {
            print_json(&output);
            ExitCode::SUCCESS
        }
        Err(output) => {
            print_json(&output);
            ExitCode::FAILURE
        }
    }
}

/// `Ok` carries the provider's payload (data or `{"error"}`), `Err` a fatal error
async fn lookup(
    enrichment: &EnrichmentAggregator,
    credentials: &Credentials,
    provider: &str,
    ip: &str,
) -> Result<Value, Value> {
    let Some(selected) = enrichment.provider(provider) else {
        return Err(json!({
            "error": format!(
                "Unknown provider '{}', expected one of: {}",
                provider,
                enrichment.provider_names().join(", ")
            )
        }));
    };

    credentials
        .require(provider)
        .map_err(|e| json!({ "error": e.to_string() }))?;

    Ok(selected.check(ip).await.to_lookup_json())
}
