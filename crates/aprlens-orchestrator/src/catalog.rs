//! Default task definitions.
//!
//! Instructions are loaded from `{dir}/{kind}.md` when an instructions
//! directory is configured and the file exists; otherwise a short built-in
//! text is used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use aprlens_core::{ExecutionPolicy, TaskDefinition, TaskKind};
use aprlens_services::capabilities::{
    metrics_capability, GET_CONTROL_PLAN_METRICS, GET_FEATURE_RANKINGS, GET_PRS_FOR_APR,
    GET_PULL_REQUEST_BODY, GET_PULL_REQUEST_TITLE, GET_TICKET_ATTACHMENTS, GET_TICKET_DESCRIPTION,
    GET_TICKET_RELEASE_NOTES, GET_TICKET_TITLE, PUBLISH_REPORT,
};

use crate::error::PipelineError;

/// Inputs for building the default definitions.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Model deployment every worker runs on.
    pub model: String,
    pub instructions_dir: Option<PathBuf>,
    pub max_retries: u32,
    pub analysis_timeout: Duration,
    pub linking_timeout: Duration,
    pub synthesis_timeout: Duration,
    /// Give the synthesis worker the publishing capability.
    pub publish: bool,
}

impl CatalogOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            instructions_dir: None,
            max_retries: ExecutionPolicy::DEFAULT_MAX_RETRIES,
            analysis_timeout: ExecutionPolicy::ANALYSIS_TIMEOUT,
            linking_timeout: ExecutionPolicy::EXTENDED_TIMEOUT,
            synthesis_timeout: ExecutionPolicy::EXTENDED_TIMEOUT,
            publish: false,
        }
    }

    fn timeout(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Linker => self.linking_timeout,
            TaskKind::Synthesis => self.synthesis_timeout,
            _ => self.analysis_timeout,
        }
    }
}

/// Capabilities a worker of `kind` may invoke.
pub fn capabilities_for(kind: TaskKind, publish: bool) -> Vec<String> {
    let mut names: Vec<String> = match kind {
        TaskKind::Pav | TaskKind::Ppa | TaskKind::Sup | TaskKind::Dup => {
            vec![GET_FEATURE_RANKINGS.to_string(), metrics_capability(kind)]
        }
        TaskKind::Linker => [
            GET_PRS_FOR_APR,
            GET_PULL_REQUEST_TITLE,
            GET_PULL_REQUEST_BODY,
            GET_CONTROL_PLAN_METRICS,
            GET_TICKET_TITLE,
            GET_TICKET_DESCRIPTION,
            GET_TICKET_RELEASE_NOTES,
            GET_TICKET_ATTACHMENTS,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        TaskKind::Synthesis => [GET_TICKET_TITLE, GET_TICKET_DESCRIPTION, GET_PULL_REQUEST_TITLE]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };
    if publish && kind == TaskKind::Synthesis {
        names.push(PUBLISH_REPORT.to_string());
    }
    names
}

/// Built-in instructions for `kind`.
pub fn default_instructions(kind: TaskKind) -> String {
    match kind {
        TaskKind::Pav | TaskKind::Ppa | TaskKind::Sup | TaskKind::Dup => {
            let label = kind.label();
            format!(
                "You are the {label} agent, a map data expert analysing {label} metrics.\n\
                 1. Call {rankings} to learn which features matter most.\n\
                 2. Call {metrics} for the APR you are given.\n\
                 3. Report every significant pattern: several countries moving on the same \
                 definitiontag, or one country moving across many definitiontags. Rank \
                 high-importance features first. Quote the metric values and their type \
                 ({label}) next to each pattern. For SUP and DUP a negative change is an \
                 improvement; for PAV and PPA it is a regression.\n\
                 If nothing stands out, say \"No significant patterns found\".",
                label = label,
                rankings = GET_FEATURE_RANKINGS,
                metrics = metrics_capability(kind),
            )
        }
        TaskKind::Linker => format!(
            "You are the linker agent. Match each metric pattern you are given to the \
             tickets and pull requests that caused it.\n\
             1. Call {prs} for the APR.\n\
             2. For every pull request call {pr_title} and collect the ticket keys it names.\n\
             3. For every ticket call {title} and {description}.\n\
             A ticket matches a pattern only if it concerns the same country and describes a \
             data change, not tooling. List each pattern with its matching tickets, or state \
             that it has none.",
            prs = GET_PRS_FOR_APR,
            pr_title = GET_PULL_REQUEST_TITLE,
            title = GET_TICKET_TITLE,
            description = GET_TICKET_DESCRIPTION,
        ),
        TaskKind::Synthesis => "You are the coordinator. Combine the metric analyses and the \
             linker findings into one release report: an executive summary, the significant \
             patterns per metric family with their values, and the tickets linked to each \
             pattern. Mark any analysis that was unavailable."
            .to_string(),
    }
}

async fn load_instructions(dir: Option<&Path>, kind: TaskKind) -> Result<String, PipelineError> {
    let Some(dir) = dir else {
        return Ok(default_instructions(kind));
    };
    let path = dir.join(format!("{}.md", kind.as_str()));
    match tokio::fs::read_to_string(&path).await {
        Ok(text) if !text.trim().is_empty() => {
            debug!(kind = %kind, path = %path.display(), "Loaded instructions");
            Ok(text)
        }
        Ok(_) => Err(PipelineError::Configuration(format!(
            "instructions file {} is empty",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default_instructions(kind)),
        Err(e) => Err(PipelineError::Configuration(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// One definition per task kind.
pub async fn build_definitions(options: &CatalogOptions) -> Result<Vec<TaskDefinition>, PipelineError> {
    let mut definitions = Vec::with_capacity(TaskKind::ALL.len());
    for kind in TaskKind::ALL {
        let instructions = load_instructions(options.instructions_dir.as_deref(), kind).await?;
        let def = TaskDefinition::new(kind, options.model.clone(), instructions)
            .with_capabilities(capabilities_for(kind, options.publish))
            .with_description(format!("{} stage worker", kind.stage()))
            .with_policy(ExecutionPolicy::new(options.timeout(kind), options.max_retries));
        definitions.push(def);
    }
    info!(count = definitions.len(), model = %options.model, "Task definitions built");
    Ok(definitions)
}
