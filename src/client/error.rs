use reqwest::StatusCode;
use thiserror::Error;

/// Rejected configuration, reported before any request is issued.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Date range start {start} is after end {end}")]
    InvertedRange { start: String, end: String },

    #[error("Last-modified range spans {days} days, the API limit is {limit}")]
    ModifiedRangeTooWide { days: i64, limit: i64 },

    #[error("GitHub advisory requests require a token")]
    MissingToken,

    #[error("Invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Cannot construct HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Received HTTP Status Code: {}", .status.as_u16())]
    Upstream { status: StatusCode },

    #[error("Malformed {context} response: {reason}")]
    Decode {
        context: &'static str,
        reason: String,
    },

    #[error("GraphQL query failed: {message}")]
    GraphQl { message: String },

    #[error("Request task interrupted")]
    Interrupted,
}

impl Error {
    /// The HTTP status that stopped the fetch, if that is what went wrong.
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            Self::Upstream { status } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
