//! Paged retrieval of GitHub Security Advisories.
//!
//! The GraphQL API paginates with cursors: each response states whether a
//! further page exists and where it starts, so requests are strictly
//! sequential and there is nothing to fan out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backoff::BackoffConfig;
use crate::client::error::{ConfigError, Error, Result};
use crate::client::{ClientPool, PoolBuilder, DEFAULT_REQUEST_TIMEOUT};
use crate::config;
use crate::nvd::filter::format_api_date;

/// The GitHub GraphQL endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.github.com/graphql";

/// Largest advisory page the API will serve.
pub const MAX_ADVISORIES_PER_PAGE: u32 = 100;

const ADVISORIES_QUERY: &str = r#"
query($first: Int!, $after: String, $updatedSince: DateTime, $publishedSince: DateTime, $classifications: [SecurityAdvisoryClassification!]) {
  securityAdvisories(first: $first, after: $after, updatedSince: $updatedSince, publishedSince: $publishedSince, classifications: $classifications, orderBy: {field: UPDATED_AT, direction: ASC}) {
    totalCount
    pageInfo { hasNextPage endCursor }
    nodes {
      ghsaId
      summary
      description
      severity
      classification
      publishedAt
      updatedAt
      withdrawnAt
      origin
      permalink
      identifiers { type value }
      references { url }
      cwes(first: 10) { nodes { cweId name } }
      vulnerabilities(first: 10) {
        nodes {
          package { ecosystem name }
          vulnerableVersionRange
          firstPatchedVersion { identifier }
          severity
        }
      }
    }
  }
}
"#;

/// Configuration for [`AdvisoryIterator`].
#[derive(Debug, Clone)]
pub struct GhsaClientConfig {
    /// Bearer token; required.
    pub token: Option<String>,
    pub endpoint: String,
    /// Minimum gap between consecutive requests.
    pub delay: Duration,
    /// Advisories per page, clamped to `[1, 100]`.
    pub results_per_page: u32,
    pub max_retry_count: usize,
    pub backoff: BackoffConfig,
    pub timeout: Duration,
    /// Only advisories updated at or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
    /// Only advisories published at or after this instant.
    pub published_since: Option<DateTime<Utc>>,
    /// Comma-separated classification names, e.g. `GENERAL,MALWARE`.
    pub classifications: Option<String>,
}

impl Default for GhsaClientConfig {
    fn default() -> Self {
        Self {
            token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            delay: Duration::ZERO,
            results_per_page: MAX_ADVISORIES_PER_PAGE,
            max_retry_count: 0,
            backoff: BackoffConfig::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            updated_since: None,
            published_since: None,
            classifications: None,
        }
    }
}

impl GhsaClientConfig {
    /// Defaults, with the token picked up from `GITHUB_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            token: config::github_token(),
            ..Default::default()
        }
    }
}

/// A security advisory: the fields the mirror reads, plus the verbatim node.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryRecord {
    pub ghsa_id: String,
    pub published: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// The full advisory node as received.
    pub body: Value,
}

impl AdvisoryRecord {
    pub fn from_node(node: Value) -> Result<Self> {
        let ghsa_id = node
            .get("ghsaId")
            .and_then(Value::as_str)
            .ok_or_else(|| decode_error("advisory is missing \"ghsaId\""))?
            .to_string();
        let published = required_timestamp(&node, "publishedAt", &ghsa_id)?;
        let updated = required_timestamp(&node, "updatedAt", &ghsa_id)?;

        Ok(Self {
            ghsa_id,
            published,
            updated,
            body: node,
        })
    }
}

/// The unit an advisory fetch yields to the consumer.
#[derive(Debug)]
pub struct AdvisoryBatch {
    pub records: Vec<AdvisoryRecord>,
    /// The server's total advisory count for the whole query.
    pub total_available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Fresh,
    Streaming { cursor: String },
    Drained,
    Terminated,
    Closed,
}

/// Lazy, finite sequence of [`AdvisoryBatch`]es for one advisory query.
pub struct AdvisoryIterator {
    endpoint: Url,
    token: String,
    results_per_page: u32,
    updated_since: Option<DateTime<Utc>>,
    published_since: Option<DateTime<Utc>>,
    classifications: Option<Vec<String>>,
    pool: Arc<ClientPool>,
    state: State,
    total_results: Option<u32>,
    last_updated: Option<DateTime<Utc>>,
    last_status: Option<StatusCode>,
}

impl AdvisoryIterator {
    pub fn new(config: GhsaClientConfig) -> Result<Self> {
        let token = config.token.ok_or(ConfigError::MissingToken)?;
        let endpoint = Url::parse(&config.endpoint).map_err(|error| ConfigError::InvalidEndpoint {
            url: config.endpoint.clone(),
            reason: error.to_string(),
        })?;

        let pool = PoolBuilder::new(true)
            .thread_count(1)
            .delay(config.delay)
            .max_retry_count(config.max_retry_count)
            .backoff_config(config.backoff.clone())
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            endpoint,
            token,
            results_per_page: config.results_per_page.clamp(1, MAX_ADVISORIES_PER_PAGE),
            updated_since: config.updated_since,
            published_since: config.published_since,
            classifications: config
                .classifications
                .as_deref()
                .map(parse_classifications),
            pool: Arc::new(pool),
            state: State::Fresh,
            total_results: None,
            last_updated: None,
            last_status: None,
        })
    }

    /// Total matching advisories, known once the first page completed.
    pub fn total_results(&self) -> Option<u32> {
        self.total_results
    }

    /// Latest `updatedAt` seen across fetched advisories.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Status of the most recent response.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        self.last_status
    }

    pub fn has_next(&self) -> bool {
        matches!(self.state, State::Fresh | State::Streaming { .. })
    }

    /// End the sequence; subsequent calls yield nothing.
    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    /// Fetch and deliver the next page.
    pub async fn next_batch(&mut self) -> Result<Option<AdvisoryBatch>> {
        let after = match &self.state {
            State::Fresh => None,
            State::Streaming { cursor } => Some(cursor.clone()),
            State::Drained | State::Terminated | State::Closed => return Ok(None),
        };

        match self.fetch_page(after).await {
            Ok((batch, page_info)) => {
                self.state = match (page_info.has_next_page, page_info.end_cursor) {
                    (true, Some(cursor)) => State::Streaming { cursor },
                    _ => {
                        debug!("All advisory pages delivered");
                        State::Drained
                    }
                };
                Ok(Some(batch))
            }
            Err(error) => {
                self.state = State::Terminated;
                Err(error)
            }
        }
    }

    async fn fetch_page(&mut self, after: Option<String>) -> Result<(AdvisoryBatch, PageInfo)> {
        let body = json!({
            "query": ADVISORIES_QUERY,
            "variables": {
                "first": self.results_per_page,
                "after": after,
                "updatedSince": self.updated_since.as_ref().map(format_api_date),
                "publishedSince": self.published_since.as_ref().map(format_api_date),
                "classifications": self.classifications,
            },
        });

        let request = self
            .pool
            .http()
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&body);

        let response = self.pool.execute(request).await?;
        let status = response.status();
        self.last_status = Some(status);
        if !status.is_success() {
            warn!(status = status.as_u16(), "Advisory request failed");
            return Err(Error::Upstream { status });
        }

        let envelope: GraphQlEnvelope =
            response.json().await.map_err(|error| Error::Decode {
                context: "GitHub GraphQL",
                reason: error.to_string(),
            })?;

        if !envelope.errors.is_empty() {
            let message = envelope
                .errors
                .into_iter()
                .map(|entry| entry.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::GraphQl { message });
        }

        let connection = envelope
            .data
            .ok_or_else(|| decode_error("response carries neither data nor errors"))?
            .security_advisories;

        let records = connection
            .nodes
            .into_iter()
            .map(AdvisoryRecord::from_node)
            .collect::<Result<Vec<_>>>()?;

        for record in &records {
            self.last_updated = Some(match self.last_updated {
                Some(current) => current.max(record.updated),
                None => record.updated,
            });
        }
        self.total_results = Some(connection.total_count);

        Ok((
            AdvisoryBatch {
                records,
                total_available: connection.total_count,
            },
            connection.page_info,
        ))
    }
}

impl std::fmt::Debug for AdvisoryIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryIterator")
            .field("state", &self.state)
            .field("total_results", &self.total_results)
            .finish_non_exhaustive()
    }
}

fn parse_classifications(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_ascii_uppercase())
        .filter(|part| !part.is_empty())
        .collect()
}

fn required_timestamp(node: &Value, field: &str, id: &str) -> Result<DateTime<Utc>> {
    node.get(field)
        .and_then(Value::as_str)
        .and_then(crate::nvd::parse_timestamp)
        .ok_or_else(|| decode_error(&format!("{id} is missing a parseable \"{field}\"")))
}

fn decode_error(reason: &str) -> Error {
    Error::Decode {
        context: "GitHub GraphQL",
        reason: reason.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<GraphQlData>,
    #[serde(default)]
    errors: Vec<GraphQlErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorEntry {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlData {
    security_advisories: AdvisoryConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvisoryConnection {
    total_count: u32,
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn advisory_node_round_trips() {
        let node = json!({
            "ghsaId": "GHSA-abcd-1234-efgh",
            "summary": "demo",
            "publishedAt": "2024-02-01T08:00:00Z",
            "updatedAt": "2024-03-05T09:30:00Z"
        });

        let record = AdvisoryRecord::from_node(node.clone()).unwrap();
        assert_eq!(record.ghsa_id, "GHSA-abcd-1234-efgh");
        assert_eq!(record.body, node);
        assert!(record.updated > record.published);
    }

    #[test]
    fn node_without_id_fails_decode() {
        let node = json!({
            "publishedAt": "2024-02-01T08:00:00Z",
            "updatedAt": "2024-03-05T09:30:00Z"
        });

        assert_matches!(
            AdvisoryRecord::from_node(node),
            Err(Error::Decode { context: "GitHub GraphQL", .. })
        );
    }

    #[test]
    fn classifications_split_and_normalize() {
        assert_eq!(
            parse_classifications("general, malware ,"),
            vec!["GENERAL".to_string(), "MALWARE".to_string()]
        );
    }

    #[test]
    fn missing_token_is_a_config_error() {
        assert_matches!(
            AdvisoryIterator::new(GhsaClientConfig::default()),
            Err(Error::Config(ConfigError::MissingToken))
        );
    }

    #[test]
    fn graphql_error_envelope_decodes() {
        let raw = json!({
            "data": null,
            "errors": [{"message": "rate limited"}]
        });
        let envelope: GraphQlEnvelope = serde_json::from_value(raw).unwrap();
        assert!(envelope.data.is_none());
        assert_eq!(envelope.errors[0].message, "rate limited");
    }
}
