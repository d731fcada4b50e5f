//! SQL statement client for the metrics warehouse.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use aprlens_core::TaskKind;

use crate::error::ServiceError;

const SERVICE: &str = "tabular";

/// Default catalog holding the per-run schemas.
pub const DEFAULT_CATALOG: &str = "pois_aqua_dev";

/// Table of flagged metric movements inside each `run_apr_{key}` schema.
const ISSUE_TABLE: &str = "issue_list";

/// Schema and table mapping release tags to pull requests.
const PR_SCHEMA: &str = "control_plan_automation";
const PR_TABLE: &str = "release_tag_to_apr_number";
const PR_COLUMN: &str = "consecutiveAPRPullRequests";

/// Movements at or below this absolute difference are not reported.
pub const DIFF_THRESHOLD: f64 = 3.0;

/// Connection settings for the SQL warehouse.
#[derive(Clone)]
pub struct TabularConfig {
    /// Workspace host, e.g. `https://adb-123.azuredatabricks.net`.
    pub host: String,
    /// Bearer token.
    pub token: String,
    /// Warehouse that executes the statements.
    pub warehouse_id: String,
    /// Catalog holding the per-run schemas.
    pub catalog: String,
}

impl TabularConfig {
    pub fn new(
        host: impl Into<String>,
        token: impl Into<String>,
        warehouse_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            token: token.into(),
            warehouse_id: warehouse_id.into(),
            catalog: DEFAULT_CATALOG.to_string(),
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = catalog.into();
        self
    }
}

impl std::fmt::Debug for TabularConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularConfig")
            .field("host", &self.host)
            .field("warehouse_id", &self.warehouse_id)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

/// Rows returned by one statement. Cells are kept as the warehouse sends
/// them: strings or null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl TabularResult {
    /// Index of a column by case-insensitive name.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Cell value at `row` for column `name`.
    pub fn get(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.column(name)?;
        self.rows.get(row)?.get(col)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Decode every row as a [`MetricRow`].
    pub fn metric_rows(&self) -> Result<Vec<MetricRow>, ServiceError> {
        let missing = ["country", "definitiontag", "diff_absolute"]
            .into_iter()
            .find(|c| self.column(c).is_none());
        if let Some(column) = missing {
            return Err(ServiceError::InvalidInput(format!(
                "metric result has no '{}' column",
                column
            )));
        }

        (0..self.len())
            .map(|i| {
                let diff = self.get(i, "diff_absolute").unwrap_or_default();
                let diff_absolute = diff.trim().parse::<f64>().map_err(|_| {
                    ServiceError::InvalidInput(format!("row {}: bad diff_absolute '{}'", i, diff))
                })?;
                Ok(MetricRow {
                    country: self.get(i, "country").unwrap_or_default().to_string(),
                    definition_tag: self.get(i, "definitiontag").unwrap_or_default().to_string(),
                    diff_absolute,
                })
            })
            .collect()
    }
}

/// One flagged metric movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub country: String,
    pub definition_tag: String,
    pub diff_absolute: f64,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    status: Option<StatementStatus>,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<StatementData>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StatementErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
}

#[derive(Debug, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Deserialize)]
struct ManifestColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatementData {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
}

/// Client for the SQL statement execution API.
#[derive(Debug, Clone)]
pub struct TabularClient {
    inner: reqwest::Client,
    config: TabularConfig,
}

impl TabularClient {
    pub fn new(config: TabularConfig) -> Self {
        Self {
            inner: reqwest::Client::new(),
            config,
        }
    }

    /// Execute `statement` against `schema` and wait for its rows.
    pub async fn execute(&self, schema: &str, statement: &str) -> Result<TabularResult, ServiceError> {
        let url = format!("{}/api/2.0/sql/statements/", self.config.host);
        debug!(schema = %schema, statement = %statement, "Executing statement");

        let response = self
            .inner
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&json!({
                "statement": statement,
                "warehouse_id": self.config.warehouse_id,
                "catalog": self.config.catalog,
                "schema": schema,
                "wait_timeout": "30s",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::from_response(SERVICE, response).await);
        }

        let body: StatementResponse = response.json().await?;
        if let Some(status) = &body.status {
            if status.state != "SUCCEEDED" {
                return Err(ServiceError::Statement {
                    state: status.state.clone(),
                    message: status
                        .error
                        .as_ref()
                        .and_then(|e| e.message.clone())
                        .unwrap_or_default(),
                });
            }
        }

        let columns = body
            .manifest
            .map(|m| m.schema.columns.into_iter().map(|c| c.name).collect())
            .unwrap_or_default();
        let rows = body.result.map(|r| r.data_array).unwrap_or_default();
        Ok(TabularResult { columns, rows })
    }

    /// Metric movements of one analysis family for a run.
    pub async fn metrics_for(&self, key: &str, kind: TaskKind) -> Result<Vec<MetricRow>, ServiceError> {
        let key = numeric_key(key)?;
        if !kind.is_analysis() {
            return Err(ServiceError::InvalidInput(format!(
                "{} has no metric family",
                kind.label()
            )));
        }

        let schema = format!("run_apr_{}", key);
        let statement = format!(
            "select country, definitiontag, diff_absolute FROM {}.{}.{} \
             WHERE validation_theme = '{}' and abs(diff_absolute) > {}",
            self.config.catalog,
            schema,
            ISSUE_TABLE,
            kind.as_str(),
            DIFF_THRESHOLD
        );
        let rows = self.execute(&schema, &statement).await?.metric_rows()?;
        info!(key = %key, kind = %kind.label(), rows = rows.len(), "Fetched metrics");
        Ok(rows)
    }

    /// Pull request numbers released with a run.
    pub async fn pull_requests_for(&self, key: &str) -> Result<Vec<String>, ServiceError> {
        let key = numeric_key(key)?;
        let statement = format!(
            "select {} FROM {}.{}.{} WHERE aprNumber = {}",
            PR_COLUMN, self.config.catalog, PR_SCHEMA, PR_TABLE, key
        );
        let result = self.execute(PR_SCHEMA, &statement).await?;

        let prs: Vec<String> = (0..result.len())
            .filter_map(|i| result.get(i, PR_COLUMN))
            .flat_map(split_pr_list)
            .collect();
        info!(key = %key, prs = prs.len(), "Fetched pull requests");
        Ok(prs)
    }
}

/// Keys are interpolated into SQL, so only digits are accepted.
fn numeric_key(key: &str) -> Result<&str, ServiceError> {
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::InvalidInput(format!(
            "pipeline key '{}' is not numeric",
            key
        )));
    }
    Ok(key)
}

/// Split a stored pull request list (`"[12, 13]"`, `"12,13"` or a JSON array
/// of strings) into numbers.
fn split_pr_list(cell: &str) -> Vec<String> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(cell) {
        return items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect();
    }
    cell.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
