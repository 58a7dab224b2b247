use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of one run (one batch execution and one event sequence).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Status of a test and badge of a suite.
///
/// Variants are declared in badge priority order, so `max()` over a set of
/// statuses yields the badge: failed > passed > skipped > unknown.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unknown,
    Skipped,
    Passed,
    Failed,
}

impl Status {
    /// Parses a producer status string. Case-insensitive; anything unrecognised is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Skipped => "skipped",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    /// Highest-priority status of `statuses`, or `Unknown` when empty.
    pub fn badge_of(statuses: impl IntoIterator<Item = Status>) -> Self {
        statuses.into_iter().max().unwrap_or_default()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw producer status to the stored status.
///
/// A failure caused by a failed dependency (any message starting with
/// "dependency", case-insensitive) is stored as `Skipped`: the test did not
/// run, it did not fail an assertion.
pub fn normalize_status(raw: &str, messages: &[String]) -> Status {
    let status = Status::parse(raw);
    if status == Status::Failed
        && messages.iter().any(|m| {
            m.get(..DEPENDENCY_PREFIX.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(DEPENDENCY_PREFIX))
        })
    {
        return Status::Skipped;
    }
    status
}

const DEPENDENCY_PREFIX: &str = "dependency";

/// Authoritative per-suite counts carried by `suiteEnd`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteSummary {
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SuiteSummary {
    /// Badge implied by the counts, same priority as test-derived badges.
    pub fn badge(&self) -> Status {
        if self.failed > 0 {
            Status::Failed
        } else if self.passed > 0 {
            Status::Passed
        } else if self.skipped > 0 {
            Status::Skipped
        } else {
            Status::Unknown
        }
    }
}

/// Latest known result of one test, keyed by (suite path, name).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub name: String,
    pub status: Status,
    pub duration_ms: u64,
    pub messages: Vec<String>,
    pub last_updated_at: DateTime<Utc>,
}
