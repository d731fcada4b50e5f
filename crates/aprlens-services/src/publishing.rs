//! Wiki publishing client.

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::ServiceError;

const SERVICE: &str = "publishing";

/// Connection settings for the wiki.
#[derive(Clone)]
pub struct PublishingConfig {
    /// Site root, `/wiki` root, or the content endpoint itself.
    pub base_url: String,
    pub username: String,
    pub token: String,
    /// Space new pages are created in.
    pub space_key: String,
    /// Page new pages are nested under.
    pub parent_id: Option<String>,
}

impl PublishingConfig {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        token: impl Into<String>,
        space_key: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            token: token.into(),
            space_key: space_key.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Content endpoints to try, in order.
    ///
    /// A root without `/wiki` is tried with it first; a `/wiki` root is tried
    /// with and then without it. Only a 404 moves on to the next candidate.
    pub fn content_endpoints(&self) -> Vec<String> {
        let base = self.base_url.as_str();
        let lowered = base.to_ascii_lowercase();
        if lowered.contains("/rest/api/content") {
            return vec![base.to_string()];
        }
        let mut candidates = if lowered.ends_with("/wiki") {
            let root = &base[..base.len() - "/wiki".len()];
            vec![
                format!("{}/rest/api/content", base),
                format!("{}/rest/api/content", root),
            ]
        } else {
            vec![
                format!("{}/wiki/rest/api/content", base),
                format!("{}/rest/api/content", base),
            ]
        };
        candidates.dedup();
        candidates
    }
}

impl std::fmt::Debug for PublishingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishingConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("space_key", &self.space_key)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

/// A page that was created.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedPage {
    pub id: String,
    pub title: String,
    pub link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedPage {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "_links")]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    webui: Option<String>,
}

/// Client that creates wiki pages.
#[derive(Debug, Clone)]
pub struct PublishingClient {
    inner: reqwest::Client,
    config: PublishingConfig,
}

impl PublishingClient {
    pub fn new(config: PublishingConfig) -> Self {
        Self {
            inner: reqwest::Client::new(),
            config,
        }
    }

    /// Create a page from markdown `body`.
    pub async fn create_page(&self, title: &str, body: &str) -> Result<PublishedPage, ServiceError> {
        if title.trim().is_empty() {
            return Err(ServiceError::InvalidInput("page title is empty".to_string()));
        }

        let mut payload = json!({
            "type": "page",
            "title": title,
            "space": {"key": self.config.space_key},
            "body": {
                "storage": {
                    "value": markdown_to_storage(body),
                    "representation": "storage"
                }
            }
        });
        if let Some(parent) = &self.config.parent_id {
            payload["ancestors"] = json!([{ "id": parent }]);
        }

        let endpoints = self.config.content_endpoints();
        let mut last_error = None;
        for endpoint in &endpoints {
            let response = self
                .inner
                .post(endpoint)
                .basic_auth(&self.config.username, Some(&self.config.token))
                .json(&payload)
                .send()
                .await?;

            if response.status().is_success() {
                let page: CreatedPage = response.json().await?;
                let link = page.links.as_ref().and_then(|l| self.page_link(l));
                info!(id = %page.id, title = %title, "Page published");
                return Ok(PublishedPage {
                    id: page.id,
                    title: page.title.unwrap_or_else(|| title.to_string()),
                    link,
                });
            }

            let not_found = response.status().as_u16() == 404;
            let err = ServiceError::from_response(SERVICE, response).await;
            warn!(endpoint = %endpoint, error = %err, "Page creation failed");
            last_error = Some(err);
            if !not_found {
                break;
            }
        }

        Err(last_error.unwrap_or(ServiceError::NotConfigured("publishing endpoint")))
    }

    fn page_link(&self, links: &PageLinks) -> Option<String> {
        let webui = links.webui.as_deref()?;
        match links.base.as_deref() {
            Some(base) => Some(format!("{}{}", base, webui)),
            None => {
                let root = self
                    .config
                    .base_url
                    .split("/rest/api/content")
                    .next()
                    .unwrap_or(&self.config.base_url);
                Some(format!("{}{}", root, webui))
            }
        }
    }
}

/// Convert a markdown subset (paragraphs and fenced code) to storage markup.
///
/// Text is HTML-escaped; fenced blocks become code macros.
pub fn markdown_to_storage(markdown: &str) -> String {
    let text = markdown.replace("\r\n", "\n");
    let mut out = String::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut code: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some((lang, body)) = code.as_mut() {
            if line.trim_start().starts_with("```") {
                out.push_str(&code_macro(lang, &body.join("\n")));
                code = None;
            } else {
                body.push(line);
            }
            continue;
        }

        if let Some(rest) = line.trim_start().strip_prefix("```") {
            flush_paragraph(&mut out, &mut paragraph);
            code = Some((rest.trim().to_string(), Vec::new()));
        } else if line.trim().is_empty() {
            flush_paragraph(&mut out, &mut paragraph);
        } else {
            paragraph.push(line);
        }
    }

    if let Some((lang, body)) = code {
        out.push_str(&code_macro(&lang, &body.join("\n")));
    }
    flush_paragraph(&mut out, &mut paragraph);

    if out.is_empty() {
        out.push_str("<p></p>");
    }
    out
}

fn flush_paragraph(out: &mut String, paragraph: &mut Vec<&str>) {
    if paragraph.is_empty() {
        return;
    }
    out.push_str("<p>");
    out.push_str(&escape_html(&paragraph.join("\n")));
    out.push_str("</p>");
    paragraph.clear();
}

fn code_macro(lang: &str, body: &str) -> String {
    let language = if lang.is_empty() {
        String::new()
    } else {
        format!("<ac:parameter ac:name=\"language\">{}</ac:parameter>", escape_html(lang))
    };
    format!(
        "<ac:structured-macro ac:name=\"code\">{}<ac:plain-text-body><![CDATA[{}]]></ac:plain-text-body></ac:structured-macro>",
        language,
        body.replace("]]>", "]]]]><![CDATA[>")
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_content_endpoints() {
        let cfg = PublishingConfig::new("https://acme.atlassian.net", "u", "t", "APR");
        assert_eq!(
            cfg.content_endpoints(),
            vec![
                "https://acme.atlassian.net/wiki/rest/api/content",
                "https://acme.atlassian.net/rest/api/content"
            ]
        );

        let cfg = PublishingConfig::new("https://acme.atlassian.net/wiki/", "u", "t", "APR");
        assert_eq!(cfg.content_endpoints()[0], "https://acme.atlassian.net/wiki/rest/api/content");

        let cfg = PublishingConfig::new("https://x/wiki/rest/api/content", "u", "t", "APR");
        assert_eq!(cfg.content_endpoints().len(), 1);
    }

    #[test]
    fn test_markdown_to_storage() {
        let html = markdown_to_storage("Summary <b>\n\n```sql\nselect 1\n```\ntail");
        assert_eq!(
            html,
            "<p>Summary &lt;b&gt;</p>\
             <ac:structured-macro ac:name=\"code\"><ac:parameter ac:name=\"language\">sql</ac:parameter>\
             <ac:plain-text-body><![CDATA[select 1]]></ac:plain-text-body></ac:structured-macro>\
             <p>tail</p>"
        );
        assert_eq!(markdown_to_storage(""), "<p></p>");
    }

    #[tokio::test]
    async fn test_create_page_falls_back_on_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wiki/rest/api/content"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/api/content"))
            .and(body_partial_json(serde_json::json!({
                "title": "APR 121 report",
                "space": {"key": "APR"},
                "ancestors": [{"id": "99"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "555",
                "title": "APR 121 report",
                "_links": {"base": "https://wiki", "webui": "/pages/555"}
            })))
            .mount(&server)
            .await;

        let client = PublishingClient::new(
            PublishingConfig::new(server.uri(), "u", "t", "APR").with_parent("99"),
        );
        let page = client.create_page("APR 121 report", "body").await.unwrap();
        assert_eq!(page.id, "555");
        assert_eq!(page.link.as_deref(), Some("https://wiki/pages/555"));
    }

    #[tokio::test]
    async fn test_create_page_stops_on_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("title exists"))
            .expect(1)
            .mount(&server)
            .await;

        let client = PublishingClient::new(PublishingConfig::new(server.uri(), "u", "t", "APR"));
        let err = client.create_page("dup", "body").await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 409, .. }));
    }
}
