//! Code hosting client: pull requests and control plan reports.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ServiceError;

const SERVICE: &str = "code host";

/// Default REST API root.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Marker identifying the control plan report comment.
pub const CONTROL_PLAN_MARKER: &str = "Control Plan Report";

/// Connection settings for the code host.
#[derive(Clone)]
pub struct CodeHostConfig {
    pub api_base: String,
    pub token: String,
    pub owner: String,
    pub repo: String,
}

impl CodeHostConfig {
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

impl std::fmt::Debug for CodeHostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeHostConfig")
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Comment {
    #[serde(default)]
    body: Option<String>,
}

/// One row of a control plan report table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlPlanRow {
    pub country: String,
    pub category_group: String,
    pub reference: Option<f64>,
    pub actual: Option<f64>,
    pub pav_diff: Option<f64>,
}

/// Client for the code hosting REST API.
#[derive(Debug, Clone)]
pub struct CodeHostClient {
    inner: reqwest::Client,
    config: CodeHostConfig,
}

impl CodeHostClient {
    pub fn new(config: CodeHostConfig) -> Self {
        Self {
            inner: reqwest::Client::new(),
            config,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let url = format!(
            "{}/repos/{}/{}{}",
            self.config.api_base, self.config.owner, self.config.repo, path
        );
        debug!(url = %url, "GET request");

        let response = self
            .inner
            .get(&url)
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", concat!("aprlens/", env!("CARGO_PKG_VERSION")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServiceError::from_response(SERVICE, response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn pull_request(&self, number: u64) -> Result<PullRequest, ServiceError> {
        self.get(&format!("/pulls/{}", number)).await
    }

    pub async fn title(&self, number: u64) -> Result<String, ServiceError> {
        let pr = self.pull_request(number).await?;
        Ok(pr.title.unwrap_or_else(|| "No title found".to_string()))
    }

    pub async fn body(&self, number: u64) -> Result<String, ServiceError> {
        let pr = self.pull_request(number).await?;
        Ok(pr.body.unwrap_or_else(|| "No body found".to_string()))
    }

    /// Body of the first comment carrying a control plan report.
    pub async fn control_plan_report(&self, number: u64) -> Result<Option<String>, ServiceError> {
        let comments: Vec<Comment> = self.get(&format!("/pulls/{}/comments", number)).await?;
        Ok(comments
            .into_iter()
            .filter_map(|c| c.body)
            .find(|body| body.contains(CONTROL_PLAN_MARKER)))
    }

    /// Parsed control plan rows, empty when the pull request has no report.
    pub async fn control_plan(&self, number: u64) -> Result<Vec<ControlPlanRow>, ServiceError> {
        match self.control_plan_report(number).await? {
            Some(body) => Ok(parse_control_plan(&body)),
            None => Ok(Vec::new()),
        }
    }
}

/// Parse the first markdown table that has the control plan columns.
///
/// Columns are located by header name, so extra or reordered columns are
/// tolerated. Rows stop at the first line that is not a table row.
pub fn parse_control_plan(body: &str) -> Vec<ControlPlanRow> {
    let mut lines = body.lines().map(str::trim);

    let header = loop {
        match lines.next() {
            Some(line) if line.starts_with('|') => {
                let cells = split_row(line);
                if cells.iter().any(|c| c.eq_ignore_ascii_case("Country"))
                    && cells.iter().any(|c| c.eq_ignore_ascii_case("PAV Diff"))
                {
                    break cells;
                }
            }
            Some(_) => {}
            None => return Vec::new(),
        }
    };

    let index = |name: &str| header.iter().position(|c| c.eq_ignore_ascii_case(name));
    let country = index("Country");
    let category = index("Category Group");
    let reference = index("Reference");
    let actual = index("Actual");
    let pav_diff = index("PAV Diff");

    let mut rows = Vec::new();
    for line in lines {
        if !line.starts_with('|') {
            break;
        }
        let cells = split_row(line);
        if cells.iter().all(|c| c.chars().all(|ch| ch == '-' || ch == ':')) {
            continue;
        }
        let text = |idx: Option<usize>| {
            idx.and_then(|i| cells.get(i))
                .map(|s| s.to_string())
                .unwrap_or_default()
        };
        let number = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).and_then(|s| parse_number(s));
        rows.push(ControlPlanRow {
            country: text(country),
            category_group: text(category),
            reference: number(reference),
            actual: number(actual),
            pav_diff: number(pav_diff),
        });
    }

    if rows.is_empty() {
        warn!("Control plan table has no rows");
    }
    rows
}

fn split_row(line: &str) -> Vec<&str> {
    line.trim_matches('|').split('|').map(str::trim).collect()
}

fn parse_number(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .chars()
        .filter(|c| !matches!(c, ',' | '%' | '+' | ' '))
        .collect();
    cleaned.parse().ok()
}
