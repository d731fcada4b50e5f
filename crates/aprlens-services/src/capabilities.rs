//! Worker-facing capabilities backed by the service clients.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use aprlens_backend::{CapabilityArgs, CapabilityError, CapabilityHandler, CapabilityRegistry};
use aprlens_core::{CapabilityDescriptor, ParamSpec, ParamType, ReturnType, TaskKind};

use crate::codehost::CodeHostClient;
use crate::error::ServiceError;
use crate::publishing::PublishingClient;
use crate::rankings::FeatureRankings;
use crate::tabular::TabularClient;
use crate::ticket::TicketClient;

pub const GET_FEATURE_RANKINGS: &str = "get_feature_rankings";
pub const GET_PRS_FOR_APR: &str = "get_prs_for_apr";
pub const GET_PULL_REQUEST_TITLE: &str = "get_pull_request_title";
pub const GET_PULL_REQUEST_BODY: &str = "get_pull_request_body";
pub const GET_CONTROL_PLAN_METRICS: &str = "get_control_plan_metrics";
pub const GET_TICKET_TITLE: &str = "get_ticket_title";
pub const GET_TICKET_DESCRIPTION: &str = "get_ticket_description";
pub const GET_TICKET_RELEASE_NOTES: &str = "get_ticket_release_notes";
pub const GET_TICKET_ATTACHMENTS: &str = "get_ticket_attachments";
pub const PUBLISH_REPORT: &str = "publish_report";

/// Name of the metrics capability for one analysis kind.
pub fn metrics_capability(kind: TaskKind) -> String {
    format!("get_{}_metrics_for_apr", kind.as_str())
}

/// Service clients available to capabilities.
///
/// A missing client leaves its capabilities registered; calling them reports
/// the service as not configured. Publishing is the exception: without a
/// client `publish_report` is not registered at all.
#[derive(Debug, Clone, Default)]
pub struct Services {
    pub tabular: Option<TabularClient>,
    pub tickets: Option<TicketClient>,
    pub code_host: Option<CodeHostClient>,
    pub publishing: Option<PublishingClient>,
    /// Explicit rankings file; default locations are searched otherwise.
    pub rankings_path: Option<PathBuf>,
}

impl Services {
    fn tabular(&self) -> Result<&TabularClient, ServiceError> {
        self.tabular.as_ref().ok_or(ServiceError::NotConfigured("tabular data"))
    }

    fn tickets(&self) -> Result<&TicketClient, ServiceError> {
        self.tickets.as_ref().ok_or(ServiceError::NotConfigured("ticket tracker"))
    }

    fn code_host(&self) -> Result<&CodeHostClient, ServiceError> {
        self.code_host.as_ref().ok_or(ServiceError::NotConfigured("code host"))
    }

    fn publishing(&self) -> Result<&PublishingClient, ServiceError> {
        self.publishing.as_ref().ok_or(ServiceError::NotConfigured("publishing"))
    }
}

/// Operation a capability performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceOp {
    FeatureRankings,
    Metrics(TaskKind),
    PullRequestsForKey,
    PullRequestTitle,
    PullRequestBody,
    ControlPlan,
    TicketTitle,
    TicketDescription,
    TicketReleaseNotes,
    TicketAttachments,
    Publish,
}

impl ServiceOp {
    fn descriptor(self) -> CapabilityDescriptor {
        let apr = || ParamSpec::required("apr_number", ParamType::Integer, "The APR number, e.g. 121");
        let pr = || ParamSpec::required("pr_number", ParamType::Integer, "The pull request number, e.g. 3043");
        let issue = || ParamSpec::required("issue_key", ParamType::String, "The ticket key, e.g. MAPS-4210");

        match self {
            Self::FeatureRankings => CapabilityDescriptor::new(
                GET_FEATURE_RANKINGS,
                "Feature rankings used to prioritise which metric changes are significant",
            ),
            Self::Metrics(kind) => CapabilityDescriptor::new(
                metrics_capability(kind),
                format!(
                    "{} metric movements with an absolute difference above 3 for an APR",
                    kind.label()
                ),
            )
            .with_param(apr())
            .returning(ReturnType::Rows),
            Self::PullRequestsForKey => CapabilityDescriptor::new(
                GET_PRS_FOR_APR,
                "Pull request numbers released with an APR",
            )
            .with_param(apr())
            .returning(ReturnType::Rows),
            Self::PullRequestTitle => {
                CapabilityDescriptor::new(GET_PULL_REQUEST_TITLE, "Title of a pull request")
                    .with_param(pr())
            }
            Self::PullRequestBody => {
                CapabilityDescriptor::new(GET_PULL_REQUEST_BODY, "Description body of a pull request")
                    .with_param(pr())
            }
            Self::ControlPlan => CapabilityDescriptor::new(
                GET_CONTROL_PLAN_METRICS,
                "Control plan report rows posted on a pull request",
            )
            .with_param(pr())
            .returning(ReturnType::Rows),
            Self::TicketTitle => {
                CapabilityDescriptor::new(GET_TICKET_TITLE, "Title of a ticket").with_param(issue())
            }
            Self::TicketDescription => {
                CapabilityDescriptor::new(GET_TICKET_DESCRIPTION, "Description of a ticket")
                    .with_param(issue())
            }
            Self::TicketReleaseNotes => {
                CapabilityDescriptor::new(GET_TICKET_RELEASE_NOTES, "Release notes of a ticket")
                    .with_param(issue())
            }
            Self::TicketAttachments => {
                CapabilityDescriptor::new(GET_TICKET_ATTACHMENTS, "Attachment file names of a ticket")
                    .with_param(issue())
            }
            Self::Publish => CapabilityDescriptor::new(
                PUBLISH_REPORT,
                "Publish the final report as a wiki page",
            )
            .with_param(ParamSpec::required("title", ParamType::String, "Page title"))
            .with_param(ParamSpec::required("body", ParamType::String, "Report body in markdown")),
        }
    }
}

/// Capability handler dispatching to one service operation.
struct ServiceCapability {
    op: ServiceOp,
    descriptor: CapabilityDescriptor,
    services: Arc<Services>,
}

impl ServiceCapability {
    fn new(op: ServiceOp, services: Arc<Services>) -> Self {
        Self {
            op,
            descriptor: op.descriptor(),
            services,
        }
    }

    async fn run(&self, args: &CapabilityArgs) -> Result<String, ServiceError> {
        let services = &self.services;
        match self.op {
            ServiceOp::FeatureRankings => {
                let rankings = FeatureRankings::locate(services.rankings_path.as_deref()).await?;
                Ok(rankings.render())
            }
            ServiceOp::Metrics(kind) => {
                let key = args.integer("apr_number").map_err(invalid)?.to_string();
                let rows = services.tabular()?.metrics_for(&key, kind).await?;
                Ok(serde_json::to_string(&rows)?)
            }
            ServiceOp::PullRequestsForKey => {
                let key = args.integer("apr_number").map_err(invalid)?.to_string();
                let prs = services.tabular()?.pull_requests_for(&key).await?;
                Ok(serde_json::to_string(&prs)?)
            }
            ServiceOp::PullRequestTitle => services.code_host()?.title(pr_number(args)?).await,
            ServiceOp::PullRequestBody => services.code_host()?.body(pr_number(args)?).await,
            ServiceOp::ControlPlan => {
                let rows = services.code_host()?.control_plan(pr_number(args)?).await?;
                if rows.is_empty() {
                    return Ok("No control plan report found".to_string());
                }
                Ok(serde_json::to_string(&rows)?)
            }
            ServiceOp::TicketTitle => services.tickets()?.title(issue_key(args)?).await,
            ServiceOp::TicketDescription => services.tickets()?.description(issue_key(args)?).await,
            ServiceOp::TicketReleaseNotes => {
                services.tickets()?.release_notes(issue_key(args)?).await
            }
            ServiceOp::TicketAttachments => {
                let names = services.tickets()?.attachments(issue_key(args)?).await?;
                if names.is_empty() {
                    return Ok("No attachments found for this ticket.".to_string());
                }
                Ok(names.join("\n"))
            }
            ServiceOp::Publish => {
                let title = args.str("title").map_err(invalid)?;
                let body = args.str("body").map_err(invalid)?;
                let page = services.publishing()?.create_page(title, body).await?;
                Ok(match page.link {
                    Some(link) => format!("Published page '{}' (ID: {}) at {}", page.title, page.id, link),
                    None => format!("Published page '{}' (ID: {})", page.title, page.id),
                })
            }
        }
    }
}

fn invalid(e: CapabilityError) -> ServiceError {
    ServiceError::InvalidInput(e.to_string())
}

fn pr_number(args: &CapabilityArgs) -> Result<u64, ServiceError> {
    let n = args.integer("pr_number").map_err(invalid)?;
    u64::try_from(n).map_err(|_| ServiceError::InvalidInput(format!("bad pull request number {}", n)))
}

fn issue_key(args: &CapabilityArgs) -> Result<&str, ServiceError> {
    args.str("issue_key").map_err(invalid)
}

#[async_trait]
impl CapabilityHandler for ServiceCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: CapabilityArgs) -> Result<String, CapabilityError> {
        debug!(capability = %self.descriptor.name, "Invoking service capability");
        self.run(&args).await.map_err(|e| CapabilityError::Failed {
            name: self.descriptor.name.clone(),
            message: e.to_string(),
        })
    }
}

/// Build the registry of every service capability.
pub fn register_capabilities(services: Services) -> Result<CapabilityRegistry, CapabilityError> {
    let publishing = services.publishing.is_some();
    let services = Arc::new(services);

    let mut ops = vec![ServiceOp::FeatureRankings];
    ops.extend(TaskKind::ANALYSIS.into_iter().map(ServiceOp::Metrics));
    ops.extend([
        ServiceOp::PullRequestsForKey,
        ServiceOp::PullRequestTitle,
        ServiceOp::PullRequestBody,
        ServiceOp::ControlPlan,
        ServiceOp::TicketTitle,
        ServiceOp::TicketDescription,
        ServiceOp::TicketReleaseNotes,
        ServiceOp::TicketAttachments,
    ]);
    if publishing {
        ops.push(ServiceOp::Publish);
    }

    let mut registry = CapabilityRegistry::new();
    for op in ops {
        registry.register(Arc::new(ServiceCapability::new(op, services.clone())))?;
    }
    Ok(registry)
}
