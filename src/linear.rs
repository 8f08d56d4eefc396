//! Upstream metadata client.
//!
//! Thin wrapper over the Linear GraphQL API, used to resolve a team display
//! name when the webhook payload only carries a team id. Lookups are best
//! effort: callers degrade to a placeholder label on failure rather than
//! dropping the update.

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

/// Linear GraphQL endpoint.
pub const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

/// Placeholder label used when no team name can be resolved.
pub const UNKNOWN_TEAM: &str = "Unknown Team";

/// Metadata lookup timeout. Lookups are on the webhook request path, so
/// this stays in single-digit seconds.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for resolving team display names by id.
///
/// Allows the handler to be tested with a mock directory.
pub trait TeamDirectory: Send + Sync {
    /// Resolves the display name for a team id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamLookupFailed`] if the lookup fails or the
    /// team does not exist.
    fn team_name(&self, team_id: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Linear GraphQL client.
pub struct LinearClient {
    client: reqwest::Client,
    api_key: SecretString,
    api_url: String,
}

impl LinearClient {
    /// Creates a client against the production Linear API.
    #[must_use]
    pub fn new(api_key: SecretString) -> Self {
        Self::with_api_url(api_key, LINEAR_API_URL.to_string())
    }

    /// Creates a client against a custom endpoint (used in tests).
    #[must_use]
    pub fn with_api_url(api_key: SecretString, api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("Syncpulse/{}", env!("CARGO_PKG_VERSION")))
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_key,
            api_url,
        }
    }
}

impl TeamDirectory for LinearClient {
    async fn team_name(&self, team_id: &str) -> Result<String> {
        let api_key = self.api_key.expose_secret();
        if api_key.is_empty() {
            return Err(Error::UpstreamLookupFailed(
                "no upstream API key configured".to_string(),
            ));
        }

        let query = "query($id: String!) { team(id: $id) { name } }";
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", api_key)
            .json(&json!({ "query": query, "variables": { "id": team_id } }))
            .send()
            .await
            .map_err(|e| Error::UpstreamLookupFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamLookupFailed(format!(
                "HTTP {status} from upstream"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::UpstreamLookupFailed(format!("invalid response body: {e}")))?;

        body.pointer("/data/team/name")
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::UpstreamLookupFailed(format!("team {team_id} not found"))
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_api_key_fails_fast() {
        let client = LinearClient::new(SecretString::from(String::new()));
        let err = client.team_name("team-1").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamLookupFailed(_)));
    }
}
