//! Issue tracker client.

use serde::Deserialize;
use tracing::debug;

use crate::error::ServiceError;

const SERVICE: &str = "ticket tracker";

/// Field carrying release notes on every release ticket.
const RELEASE_NOTES_FIELD: &str = "customfield_10179";

/// Connection settings for the issue tracker.
#[derive(Clone)]
pub struct TicketConfig {
    /// Site root, e.g. `https://example.atlassian.net`.
    pub base_url: String,
    pub email: String,
    pub token: String,
}

impl TicketConfig {
    pub fn new(base_url: impl Into<String>, email: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            token: token.into(),
        }
    }

    /// Settings for a cloud site identified by its subdomain.
    pub fn for_domain(domain: &str, email: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(format!("https://{}.atlassian.net", domain), email, token)
    }
}

impl std::fmt::Debug for TicketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketConfig")
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// The parts of an issue workers read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub fields: IssueFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueFields {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "customfield_10179")]
    pub release_notes: Option<String>,
    #[serde(default, rename = "attachment")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub filename: Option<String>,
}

/// Client for issue lookups by key.
#[derive(Debug, Clone)]
pub struct TicketClient {
    inner: reqwest::Client,
    config: TicketConfig,
}

impl TicketClient {
    pub fn new(config: TicketConfig) -> Self {
        Self {
            inner: reqwest::Client::new(),
            config,
        }
    }

    /// Fetch an issue by key.
    pub async fn issue(&self, key: &str) -> Result<Issue, ServiceError> {
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ServiceError::InvalidInput(format!("bad issue key '{}'", key)));
        }

        let url = format!("{}/rest/api/2/issue/{}", self.config.base_url, key);
        debug!(url = %url, "GET issue");

        let response = self
            .inner
            .get(&url)
            .basic_auth(&self.config.email, Some(&self.config.token))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServiceError::from_response(SERVICE, response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn title(&self, key: &str) -> Result<String, ServiceError> {
        let issue = self.issue(key).await?;
        Ok(non_empty(issue.fields.summary, "No title found"))
    }

    pub async fn description(&self, key: &str) -> Result<String, ServiceError> {
        let issue = self.issue(key).await?;
        Ok(non_empty(issue.fields.description, "No description found"))
    }

    /// Release notes, stored in the `customfield_10179` field.
    pub async fn release_notes(&self, key: &str) -> Result<String, ServiceError> {
        let issue = self.issue(key).await?;
        debug!(key = %key, field = RELEASE_NOTES_FIELD, "Read release notes");
        Ok(non_empty(issue.fields.release_notes, "No release notes found"))
    }

    /// Attachment file names, in the order the tracker lists them.
    pub async fn attachments(&self, key: &str) -> Result<Vec<String>, ServiceError> {
        let issue = self.issue(key).await?;
        Ok(issue
            .fields
            .attachments
            .into_iter()
            .map(|a| a.filename.unwrap_or_else(|| "unknown".to_string()))
            .collect())
    }
}

fn non_empty(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_with_issue(body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/2/issue/MAPS-42"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    fn client(server: &MockServer) -> TicketClient {
        TicketClient::new(TicketConfig::new(server.uri(), "me@example.com", "secret"))
    }

    #[tokio::test]
    async fn test_issue_fields() {
        let server = server_with_issue(json!({
            "key": "MAPS-42",
            "fields": {
                "summary": "Fuel stations dropped in NLD",
                "description": "",
                "customfield_10179": "Removed stale fuel POIs",
                "attachment": [{"filename": "diff.xlsx"}, {}]
            }
        }))
        .await;
        let tickets = client(&server);

        assert_eq!(tickets.title("MAPS-42").await.unwrap(), "Fuel stations dropped in NLD");
        assert_eq!(tickets.description("MAPS-42").await.unwrap(), "No description found");
        assert_eq!(
            tickets.release_notes("MAPS-42").await.unwrap(),
            "Removed stale fuel POIs"
        );
        assert_eq!(
            tickets.attachments("MAPS-42").await.unwrap(),
            vec!["diff.xlsx", "unknown"]
        );
    }

    #[tokio::test]
    async fn test_missing_issue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Issue does not exist"))
            .mount(&server)
            .await;

        let err = client(&server).title("MAPS-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_bad_key() {
        let server = MockServer::start().await;
        let err = client(&server).title("../admin").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }
}
