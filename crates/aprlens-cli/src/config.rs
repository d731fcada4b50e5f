//! Turns parsed arguments into typed settings.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use aprlens_backend::{AgentsConfig, BackendError, CapabilityError};
use aprlens_core::{CoreError, PipelineKey};
use aprlens_orchestrator::{CatalogOptions, PipelineConfig, PipelineError};
use aprlens_services::{
    CodeHostClient, CodeHostConfig, PublishingClient, PublishingConfig, Services, TabularClient,
    TabularConfig, TicketClient, TicketConfig,
};

use crate::Args;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting --{flag} ({env})")]
    Missing {
        flag: &'static str,
        env: &'static str,
    },

    #[error("incomplete {service} settings: --{flag} is required")]
    Incomplete {
        service: &'static str,
        flag: &'static str,
    },

    #[error("--{flag} must be greater than zero")]
    Zero { flag: &'static str },

    #[error("--publish requires the publishing settings")]
    PublishingDisabled,

    #[error("invalid APR key: {0}")]
    Key(#[from] CoreError),

    #[error("cannot build agents client: {0}")]
    Backend(#[from] BackendError),

    #[error("cannot register capabilities: {0}")]
    Capability(#[from] CapabilityError),
}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Configuration(e.to_string())
    }
}

/// Everything a run needs.
#[derive(Debug)]
pub struct Settings {
    pub key: PipelineKey,
    pub agents: AgentsConfig,
    pub services: Services,
    pub catalog: CatalogOptions,
    pub pipeline: PipelineConfig,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let key = PipelineKey::parse(&args.key)?;

        let endpoint = required(&args.agents_endpoint, "agents-endpoint", "APRLENS_AGENTS_ENDPOINT")?;
        let token = required(&args.agents_token, "agents-token", "APRLENS_AGENTS_TOKEN")?;
        let model = required(&args.model, "model", "APRLENS_MODEL")?;
        let poll_interval = Duration::from_millis(non_zero(args.poll_interval_ms, "poll-interval-ms")?);
        let request_timeout =
            Duration::from_secs(non_zero(args.request_timeout_secs, "request-timeout-secs")?);
        let agents = AgentsConfig::new(endpoint, token)
            .with_api_version(&args.api_version)
            .with_poll_interval(poll_interval)
            .with_request_timeout(request_timeout);

        let services = services(args)?;
        if args.publish && services.publishing.is_none() {
            return Err(ConfigError::PublishingDisabled);
        }

        let catalog = CatalogOptions {
            instructions_dir: args.instructions_dir.clone(),
            max_retries: args.max_retries,
            analysis_timeout: Duration::from_secs(args.analysis_timeout_secs),
            linking_timeout: Duration::from_secs(args.linking_timeout_secs),
            synthesis_timeout: Duration::from_secs(args.synthesis_timeout_secs),
            publish: args.publish,
            ..CatalogOptions::new(model)
        };
        let pipeline = PipelineConfig::default().with_sequential(args.sequential);

        Ok(Self {
            key,
            agents,
            services,
            catalog,
            pipeline,
        })
    }
}

fn required(value: &Option<String>, flag: &'static str, env: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::Missing { flag, env }),
    }
}

fn non_zero(value: u64, flag: &'static str) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { flag });
    }
    Ok(value)
}

/// All of a group's settings, none of them, or an error naming the first gap.
fn group<'a, const N: usize>(
    service: &'static str,
    fields: [(&'a Option<String>, &'static str); N],
) -> Result<Option<[&'a str; N]>, ConfigError> {
    let present = fields.iter().filter(|(v, _)| v.is_some()).count();
    if present == 0 {
        warn!(service, "Not configured; its capabilities will report an error");
        return Ok(None);
    }
    let mut values = [""; N];
    for (slot, (value, flag)) in values.iter_mut().zip(fields) {
        *slot = value
            .as_deref()
            .ok_or(ConfigError::Incomplete { service, flag })?;
    }
    info!(service, "Configured");
    Ok(Some(values))
}

fn services(args: &Args) -> Result<Services, ConfigError> {
    let tabular = group(
        "tabular",
        [
            (&args.tabular_host, "tabular-host"),
            (&args.tabular_token, "tabular-token"),
            (&args.tabular_warehouse, "tabular-warehouse"),
        ],
    )?
    .map(|[host, token, warehouse]| {
        let mut config = TabularConfig::new(host, token, warehouse);
        if let Some(catalog) = &args.tabular_catalog {
            config = config.with_catalog(catalog);
        }
        TabularClient::new(config)
    });

    let tickets = group(
        "ticket",
        [
            (&args.ticket_domain, "ticket-domain"),
            (&args.ticket_email, "ticket-email"),
            (&args.ticket_token, "ticket-token"),
        ],
    )?
    .map(|[domain, email, token]| TicketClient::new(TicketConfig::for_domain(domain, email, token)));

    let code_host = group(
        "code host",
        [
            (&args.codehost_token, "codehost-token"),
            (&args.codehost_owner, "codehost-owner"),
            (&args.codehost_repo, "codehost-repo"),
        ],
    )?
    .map(|[token, owner, repo]| {
        let mut config = CodeHostConfig::new(token, owner, repo);
        if let Some(base) = &args.codehost_api_base {
            config = config.with_api_base(base);
        }
        CodeHostClient::new(config)
    });

    let publishing = group(
        "publishing",
        [
            (&args.publish_url, "publish-url"),
            (&args.publish_user, "publish-user"),
            (&args.publish_token, "publish-token"),
            (&args.publish_space, "publish-space"),
        ],
    )?
    .map(|[url, user, token, space]| {
        let mut config = PublishingConfig::new(url, user, token, space);
        if let Some(parent) = &args.publish_parent {
            config = config.with_parent(parent);
        }
        PublishingClient::new(config)
    });

    Ok(Services {
        tabular,
        tickets,
        code_host,
        publishing,
        rankings_path: args.rankings_file.clone(),
    })
}
