//! APR Lens CLI - analyse one APR and print the synthesised report.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use aprlens_backend::AgentsClient;
use aprlens_core::{PipelineEvent, PipelineStatus};
use aprlens_orchestrator::{build_definitions, EventSink, PipelineError, PipelineOrchestrator};
use aprlens_services::register_capabilities;

use config::{ConfigError, Settings};

/// Analyse the metric changes of an APR and report their likely causes.
#[derive(Parser, Debug)]
#[command(name = "aprlens", version, about = "APR metric analysis pipeline")]
pub struct Args {
    /// APR key, with or without the `APR-` prefix
    pub key: String,

    /// Hosted agents project endpoint
    #[arg(long, env = "APRLENS_AGENTS_ENDPOINT")]
    pub agents_endpoint: Option<String>,

    /// Bearer token for the agents service
    #[arg(long, env = "APRLENS_AGENTS_TOKEN", hide_env_values = true)]
    pub agents_token: Option<String>,

    /// Model deployment every worker runs on
    #[arg(long, env = "APRLENS_MODEL")]
    pub model: Option<String>,

    /// Agents API version
    #[arg(long, env = "APRLENS_API_VERSION", default_value = "v1")]
    pub api_version: String,

    /// SQL warehouse host
    #[arg(long, env = "APRLENS_TABULAR_HOST")]
    pub tabular_host: Option<String>,

    /// SQL warehouse token
    #[arg(long, env = "APRLENS_TABULAR_TOKEN", hide_env_values = true)]
    pub tabular_token: Option<String>,

    /// SQL warehouse id
    #[arg(long, env = "APRLENS_TABULAR_WAREHOUSE")]
    pub tabular_warehouse: Option<String>,

    /// Catalog holding the per-APR schemas
    #[arg(long, env = "APRLENS_TABULAR_CATALOG")]
    pub tabular_catalog: Option<String>,

    /// Ticket tracker site name (`<domain>.atlassian.net`)
    #[arg(long, env = "APRLENS_TICKET_DOMAIN")]
    pub ticket_domain: Option<String>,

    /// Ticket tracker account email
    #[arg(long, env = "APRLENS_TICKET_EMAIL")]
    pub ticket_email: Option<String>,

    /// Ticket tracker API token
    #[arg(long, env = "APRLENS_TICKET_TOKEN", hide_env_values = true)]
    pub ticket_token: Option<String>,

    /// Code host API token
    #[arg(long, env = "APRLENS_CODEHOST_TOKEN", hide_env_values = true)]
    pub codehost_token: Option<String>,

    /// Repository owner
    #[arg(long, env = "APRLENS_CODEHOST_OWNER")]
    pub codehost_owner: Option<String>,

    /// Repository name
    #[arg(long, env = "APRLENS_CODEHOST_REPO")]
    pub codehost_repo: Option<String>,

    /// Code host API root
    #[arg(long, env = "APRLENS_CODEHOST_API_BASE")]
    pub codehost_api_base: Option<String>,

    /// Publishing site root
    #[arg(long, env = "APRLENS_PUBLISH_URL")]
    pub publish_url: Option<String>,

    /// Publishing account
    #[arg(long, env = "APRLENS_PUBLISH_USER")]
    pub publish_user: Option<String>,

    /// Publishing API token
    #[arg(long, env = "APRLENS_PUBLISH_TOKEN", hide_env_values = true)]
    pub publish_token: Option<String>,

    /// Space new pages are created in
    #[arg(long, env = "APRLENS_PUBLISH_SPACE")]
    pub publish_space: Option<String>,

    /// Parent page id
    #[arg(long, env = "APRLENS_PUBLISH_PARENT")]
    pub publish_parent: Option<String>,

    /// Let the synthesis worker publish its report
    #[arg(long, env = "APRLENS_PUBLISH")]
    pub publish: bool,

    /// Directory with `<kind>.md` instruction overrides
    #[arg(long, env = "APRLENS_INSTRUCTIONS_DIR")]
    pub instructions_dir: Option<PathBuf>,

    /// Feature rankings CSV
    #[arg(long, env = "APRLENS_RANKINGS_FILE")]
    pub rankings_file: Option<PathBuf>,

    /// Retries per task after the first attempt
    #[arg(long, env = "APRLENS_MAX_RETRIES", default_value = "2")]
    pub max_retries: u32,

    /// Budget of each analysis task in seconds
    #[arg(long, env = "APRLENS_ANALYSIS_TIMEOUT_SECS", default_value = "360")]
    pub analysis_timeout_secs: u64,

    /// Budget of the linking task in seconds
    #[arg(long, env = "APRLENS_LINKING_TIMEOUT_SECS", default_value = "600")]
    pub linking_timeout_secs: u64,

    /// Budget of the synthesis task in seconds
    #[arg(long, env = "APRLENS_SYNTHESIS_TIMEOUT_SECS", default_value = "600")]
    pub synthesis_timeout_secs: u64,

    /// Interval between run status polls
    #[arg(long, env = "APRLENS_POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Timeout of a single HTTP request to the agents service in seconds
    #[arg(long, env = "APRLENS_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Run the analysis tasks one at a time
    #[arg(long, env = "APRLENS_SEQUENTIAL")]
    pub sequential: bool,

    /// Default log filter; `RUST_LOG` takes precedence
    #[arg(long, env = "APRLENS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout carries only the report.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    match run(args).await {
        Ok(status) if status.is_success() => ExitCode::SUCCESS,
        Ok(status) => {
            warn!(status = %status, "Pipeline did not complete");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "aprlens failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<PipelineStatus, PipelineError> {
    let settings = Settings::from_args(&args)?;
    info!(key = %settings.key, model = %settings.catalog.model, "Starting APR Lens");

    let registry = register_capabilities(settings.services).map_err(ConfigError::from)?;
    let backend = AgentsClient::new(settings.agents, Arc::new(registry)).map_err(ConfigError::from)?;
    let definitions = build_definitions(&settings.catalog).await?;

    let (sink, events) = EventSink::channel();
    let orchestrator =
        PipelineOrchestrator::new(Arc::new(backend), definitions, settings.pipeline)?.with_events(sink);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after cleanup");
            interrupt.cancel();
        }
    });
    let logger = tokio::spawn(log_events(events));

    let result = orchestrator.run(settings.key, cancel).await;
    // Closes the event channel so the logger drains and exits.
    drop(orchestrator);
    let _ = logger.await;

    let report = result?;
    if !report.teardown.is_clean() {
        warn!(failures = report.teardown.failures.len(), "Some backend resources were not released");
    }
    if let Some(text) = report.report() {
        println!("{}", text);
    }
    Ok(report.run.status())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<PipelineEvent>) {
    while let Some(event) = events.recv().await {
        debug!(
            run_id = %event.run_id,
            event = ?event.event_type,
            metadata = ?event.metadata,
            "Pipeline event"
        );
    }
}
