//! Documentation workspace integration.
//!
//! This module talks to the Notion API and exposes the two write-side
//! components of the pipeline:
//!
//! - **Registry** (`registry.rs`): resolves "document for team T, date D" to
//!   a page id, creating the page when absent
//! - **Blocks** (`blocks.rs`): builds and appends the content block sequence
//!   for a single project update
//!
//! All network access goes through the [`Workspace`] trait so the registry,
//! appender, handler, and rollup job can be tested against an in-memory
//! implementation.

mod blocks;
mod registry;

pub use blocks::{
    AppendOutcome, MAX_CHILDREN_PER_APPEND, append_update, build_update_blocks,
    rich_text_with_links,
};
pub(crate) use blocks::is_marker_block;
pub use registry::{DocumentRegistry, daily_title, last_friday};

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;

/// Notion REST API base URL.
pub const NOTION_API_URL: &str = "https://api.notion.com/v1";

/// Notion API version header value.
const NOTION_VERSION: &str = "2022-06-28";

/// Document operations run off the request path or with generous budgets,
/// so this is in the tens of seconds.
const DOCUMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size used when listing children and querying databases.
const PAGE_SIZE: u32 = 100;

/// A page reference returned by database queries.
#[derive(Debug, Clone)]
pub struct PageRef {
    /// Page identifier.
    pub id: String,
    /// Page title (the `Name` property, concatenated plain text).
    pub title: String,
    /// Creation timestamp, used for window filtering and stable ordering.
    pub created_time: DateTime<Utc>,
}

/// Trait over the documentation workspace API.
///
/// The production implementation is [`NotionClient`]; tests use an
/// in-memory workspace.
pub trait Workspace: Send + Sync {
    /// Finds pages in a database whose title property equals `title` exactly.
    ///
    /// Results are ordered by creation time ascending so duplicate-title
    /// races resolve deterministically to the earliest page.
    fn find_pages_by_title(
        &self,
        database_id: &str,
        title: &str,
    ) -> impl Future<Output = Result<Vec<PageRef>>> + Send;

    /// Creates a page in a database, returning its id.
    fn create_page(
        &self,
        database_id: &str,
        title: &str,
        week_ending: Option<NaiveDate>,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Sets the `Week ending on` date property of a page.
    fn set_week_ending(
        &self,
        page_id: &str,
        week_ending: NaiveDate,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Appends child blocks to a page in one batched request.
    fn append_children(
        &self,
        page_id: &str,
        blocks: &[Value],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Lists all child blocks of a page, following pagination.
    fn list_children(&self, page_id: &str) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Deletes (archives) a single block.
    fn delete_block(&self, block_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Queries a database for pages created inside `[start, end]`, ordered
    /// by creation time ascending.
    fn pages_created_between(
        &self,
        database_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<PageRef>>> + Send;

    /// Read-only reachability probe for a database. No side effects.
    fn database_reachable(&self, database_id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Notion REST API client.
pub struct NotionClient {
    client: reqwest::Client,
    api_key: SecretString,
    api_url: String,
}

impl NotionClient {
    /// Creates a client against the production Notion API.
    #[must_use]
    pub fn new(api_key: SecretString) -> Self {
        Self::with_api_url(api_key, NOTION_API_URL.to_string())
    }

    /// Creates a client against a custom endpoint (used in tests).
    #[must_use]
    pub fn with_api_url(api_key: SecretString, api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("Syncpulse/{}", env!("CARGO_PKG_VERSION")))
            .timeout(DOCUMENT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_key,
            api_url,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Notion-Version", NOTION_VERSION)
    }

    /// Sends a request and returns the parsed JSON body, classifying
    /// failures into transient and fatal errors.
    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transient(format!("{operation}: request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| Error::OperationFailed {
                operation: operation.to_string(),
                cause: format!("invalid response body: {e}"),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(operation, status, &body))
    }

    async fn query_database(&self, database_id: &str, mut body: Value) -> Result<Vec<PageRef>> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            if let (Some(cursor), Some(obj)) = (&cursor, body.as_object_mut()) {
                obj.insert("start_cursor".to_string(), json!(cursor));
            }

            let response = self
                .send(
                    "query_database",
                    self.request(
                        reqwest::Method::POST,
                        &format!("/databases/{database_id}/query"),
                    )
                    .json(&body),
                )
                .await?;

            if let Some(results) = response.get("results").and_then(Value::as_array) {
                pages.extend(results.iter().filter_map(page_ref_of));
            }

            cursor = next_cursor(&response);
            if cursor.is_none() {
                break;
            }
        }

        Ok(pages)
    }
}

impl Workspace for NotionClient {
    async fn find_pages_by_title(&self, database_id: &str, title: &str) -> Result<Vec<PageRef>> {
        let body = json!({
            "filter": { "property": "Name", "title": { "equals": title } },
            "sorts": [ { "timestamp": "created_time", "direction": "ascending" } ],
            "page_size": PAGE_SIZE,
        });
        self.query_database(database_id, body).await
    }

    async fn create_page(
        &self,
        database_id: &str,
        title: &str,
        week_ending: Option<NaiveDate>,
    ) -> Result<String> {
        let mut properties = json!({
            "Name": { "title": [ { "text": { "content": title } } ] },
        });
        if let (Some(date), Some(props)) = (week_ending, properties.as_object_mut()) {
            props.insert(
                "Week ending on".to_string(),
                json!({ "date": { "start": date.format("%Y-%m-%d").to_string() } }),
            );
        }

        let body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });

        let response = self
            .send(
                "create_page",
                self.request(reqwest::Method::POST, "/pages").json(&body),
            )
            .await?;

        response
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| Error::OperationFailed {
                operation: "create_page".to_string(),
                cause: "response missing page id".to_string(),
            })
    }

    async fn set_week_ending(&self, page_id: &str, week_ending: NaiveDate) -> Result<()> {
        let body = json!({
            "properties": {
                "Week ending on": {
                    "date": { "start": week_ending.format("%Y-%m-%d").to_string() }
                }
            }
        });

        self.send(
            "set_week_ending",
            self.request(reqwest::Method::PATCH, &format!("/pages/{page_id}"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn append_children(&self, page_id: &str, blocks: &[Value]) -> Result<()> {
        let body = json!({ "children": blocks });
        self.send(
            "append_children",
            self.request(
                reqwest::Method::PATCH,
                &format!("/blocks/{page_id}/children"),
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_children(&self, page_id: &str) -> Result<Vec<Value>> {
        let mut children = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut path = format!("/blocks/{page_id}/children?page_size={PAGE_SIZE}");
            if let Some(cursor) = &cursor {
                path.push_str(&format!("&start_cursor={cursor}"));
            }

            let response = self
                .send(
                    "list_children",
                    self.request(reqwest::Method::GET, &path),
                )
                .await?;

            if let Some(results) = response.get("results").and_then(Value::as_array) {
                children.extend(results.iter().cloned());
            }

            cursor = next_cursor(&response);
            if cursor.is_none() {
                break;
            }
        }

        Ok(children)
    }

    async fn delete_block(&self, block_id: &str) -> Result<()> {
        self.send(
            "delete_block",
            self.request(reqwest::Method::DELETE, &format!("/blocks/{block_id}")),
        )
        .await?;
        Ok(())
    }

    async fn pages_created_between(
        &self,
        database_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PageRef>> {
        let body = json!({
            "filter": { "and": [
                { "timestamp": "created_time",
                  "created_time": { "on_or_after": start.to_rfc3339() } },
                { "timestamp": "created_time",
                  "created_time": { "on_or_before": end.to_rfc3339() } },
            ]},
            "sorts": [ { "timestamp": "created_time", "direction": "ascending" } ],
            "page_size": PAGE_SIZE,
        });
        self.query_database(database_id, body).await
    }

    async fn database_reachable(&self, database_id: &str) -> Result<()> {
        self.send(
            "database_reachable",
            self.request(reqwest::Method::GET, &format!("/databases/{database_id}")),
        )
        .await?;
        Ok(())
    }
}

/// Maps an HTTP error status to the retry taxonomy.
///
/// 429 and 5xx are transient (rate limit, upstream trouble); other 4xx are
/// fatal (bad database id, revoked token) and must not be retried.
fn classify_status(operation: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let detail = format!("{operation}: HTTP {status}: {}", truncate(body, 200));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::Transient(detail)
    } else {
        Error::Fatal(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn next_cursor(response: &Value) -> Option<String> {
    if response.get("has_more").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    response
        .get("next_cursor")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Extracts a [`PageRef`] from a page object in a query response.
fn page_ref_of(page: &Value) -> Option<PageRef> {
    let id = page.get("id").and_then(Value::as_str)?;
    let created_time = page
        .get("created_time")
        .and_then(Value::as_str)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map_or_else(Utc::now, |value| value.with_timezone(&Utc));

    let title = page
        .pointer("/properties/Name/title")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();

    Some(PageRef {
        id: id.to_string(),
        title,
        created_time,
    })
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let transient = classify_status(
            "query_database",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "rate limited",
        );
        assert!(matches!(transient, Error::Transient(_)));

        let transient = classify_status("query_database", reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(matches!(transient, Error::Transient(_)));

        let fatal = classify_status("query_database", reqwest::StatusCode::NOT_FOUND, "no db");
        assert!(matches!(fatal, Error::Fatal(_)));
    }

    #[test]
    fn test_page_ref_extraction() {
        let page = serde_json::json!({
            "id": "abc-123",
            "created_time": "2026-08-26T09:00:00.000Z",
            "properties": {
                "Name": { "title": [
                    { "plain_text": "Platform Update " },
                    { "plain_text": "@2026-08-26" }
                ]}
            }
        });

        let page_ref = page_ref_of(&page).unwrap();
        assert_eq!(page_ref.id, "abc-123");
        assert_eq!(page_ref.title, "Platform Update @2026-08-26");
    }

    #[test]
    fn test_next_cursor_absent_when_done() {
        assert!(next_cursor(&serde_json::json!({ "has_more": false })).is_none());
        assert_eq!(
            next_cursor(&serde_json::json!({ "has_more": true, "next_cursor": "c2" })),
            Some("c2".to_string())
        );
    }
}
