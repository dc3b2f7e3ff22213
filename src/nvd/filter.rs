//! Query filters recognized by the CVE API.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;

use crate::client::error::ConfigError;

/// Widest last-modified range the API accepts.
pub const MAX_MODIFIED_RANGE_DAYS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvssV2Severity {
    Low,
    Medium,
    High,
}

impl CvssV2Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvssV3Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl CvssV3Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Whether a version bound includes its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBound {
    Including,
    Excluding,
}

impl VersionBound {
    fn as_str(&self) -> &'static str {
        // The service expects the lowercase spelling.
        match self {
            Self::Including => "including",
            Self::Excluding => "excluding",
        }
    }
}

/// One querystring filter for a CVE page request.
///
/// The iterator serializes whatever it is handed; range plausibility is
/// checked by [`Filter::validate`] at configuration time.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    CpeName(String),
    CveId(String),
    CvssV2Metrics(String),
    CvssV3Metrics(String),
    CweId(String),
    KeywordExactMatch(String),
    KeywordSearch(String),
    HasCertAlerts,
    HasCertNotes,
    HasKev,
    HasOval,
    IsVulnerable,
    NoRejected,
    CvssV2Severity(CvssV2Severity),
    CvssV3Severity(CvssV3Severity),
    LastModRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    PubRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    VirtualMatchString(String),
    VersionStart {
        version: String,
        bound: VersionBound,
    },
    VersionEnd {
        version: String,
        bound: VersionBound,
    },
}

impl Filter {
    /// Check the constraints the service enforces server-side.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::LastModRange { start, end } => {
                check_ordered(start, end)?;
                let days = (*end - *start).num_days();
                if days > MAX_MODIFIED_RANGE_DAYS {
                    return Err(ConfigError::ModifiedRangeTooWide {
                        days,
                        limit: MAX_MODIFIED_RANGE_DAYS,
                    });
                }
                Ok(())
            }
            Self::PubRange { start, end } => check_ordered(start, end),
            _ => Ok(()),
        }
    }

    /// Append this filter's querystring parameters to `url`.
    pub(crate) fn append_to(&self, url: &mut Url) {
        let mut pairs = url.query_pairs_mut();
        match self {
            Self::CpeName(value) => {
                pairs.append_pair("cpeName", value);
            }
            Self::CveId(value) => {
                pairs.append_pair("cveId", value);
            }
            Self::CvssV2Metrics(value) => {
                pairs.append_pair("cvssV2Metrics", value);
            }
            Self::CvssV3Metrics(value) => {
                pairs.append_pair("cvssV3Metrics", value);
            }
            Self::CweId(value) => {
                pairs.append_pair("cweId", value);
            }
            Self::KeywordExactMatch(value) => {
                pairs.append_pair("keywordExactMatch", value);
            }
            Self::KeywordSearch(value) => {
                pairs.append_pair("keywordSearch", value);
            }
            Self::HasCertAlerts => {
                pairs.append_key_only("hasCertAlerts");
            }
            Self::HasCertNotes => {
                pairs.append_key_only("hasCertNotes");
            }
            Self::HasKev => {
                pairs.append_key_only("hasKev");
            }
            Self::HasOval => {
                pairs.append_key_only("hasOval");
            }
            Self::IsVulnerable => {
                pairs.append_key_only("isVulnerable");
            }
            Self::NoRejected => {
                pairs.append_key_only("noRejected");
            }
            Self::CvssV2Severity(severity) => {
                pairs.append_pair("cvssV2Severity", severity.as_str());
            }
            Self::CvssV3Severity(severity) => {
                pairs.append_pair("cvssV3Severity", severity.as_str());
            }
            Self::LastModRange { start, end } => {
                pairs.append_pair("lastModStartDate", &format_api_date(start));
                pairs.append_pair("lastModEndDate", &format_api_date(end));
            }
            Self::PubRange { start, end } => {
                pairs.append_pair("pubStartDate", &format_api_date(start));
                pairs.append_pair("pubEndDate", &format_api_date(end));
            }
            Self::VirtualMatchString(value) => {
                pairs.append_pair("virtualMatchString", value);
            }
            Self::VersionStart { version, bound } => {
                pairs.append_pair("versionStart", version);
                pairs.append_pair("versionStartType", bound.as_str());
            }
            Self::VersionEnd { version, bound } => {
                pairs.append_pair("versionEnd", version);
                pairs.append_pair("versionEndType", bound.as_str());
            }
        }
    }
}

fn check_ordered(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Result<(), ConfigError> {
    if start > end {
        return Err(ConfigError::InvertedRange {
            start: format_api_date(start),
            end: format_api_date(end),
        });
    }
    Ok(())
}

/// UTC ISO-8601 with an explicit offset, as the API requires.
pub(crate) fn format_api_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}
