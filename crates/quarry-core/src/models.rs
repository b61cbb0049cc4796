use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Opaque key naming one extraction target (e.g. a username).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Pagination continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    /// First page; no token is sent.
    Start,
    Token(String),
    /// No further pages.
    End,
}

impl Cursor {
    pub fn token(&self) -> Option<&str> {
        match self {
            Cursor::Token(t) => Some(t),
            _ => None,
        }
    }
}

/// One item inside a page (e.g. a timeline post node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Item-level unique key, when the service provides one.
    pub key: Option<String>,
    pub data: Value,
}

impl RawItem {
    pub fn new(key: Option<String>, data: Value) -> Self {
        Self { key, data }
    }

    pub fn keyed(key: impl Into<String>, data: Value) -> Self {
        Self {
            key: Some(key.into()),
            data,
        }
    }
}

/// One paginated response for an identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct PageFragment {
    /// Cursor for the next page, or [`Cursor::End`].
    pub cursor: Cursor,
    pub items: Vec<RawItem>,
    pub has_next: bool,
    /// Profile-level fields carried on this page.
    pub fields: Map<String, Value>,
    /// When set, this fragment's non-null fields overwrite earlier ones.
    pub authoritative: bool,
}

impl PageFragment {
    /// A fragment with items only, mostly useful for tests and stubs.
    pub fn items(items: Vec<RawItem>, next: Option<&str>) -> Self {
        Self {
            cursor: next.map_or(Cursor::End, |c| Cursor::Token(c.to_string())),
            has_next: next.is_some(),
            items,
            fields: Map::new(),
            authoritative: false,
        }
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    pub fn authoritative(mut self) -> Self {
        self.authoritative = true;
        self
    }
}

/// The assembled result for one identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: Identifier,
    pub fields: Map<String, Value>,
    pub items: Vec<RawItem>,
    pub item_count: usize,
    pub pages: u32,
    pub duplicates_dropped: usize,
    /// True only if pagination reached the last page without error.
    pub complete: bool,
    /// SHA-256 of the canonical `fields` + `items` serialization.
    pub data_hash: String,
}

/// Result of processing one identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkOutcome {
    Success {
        record: Record,
        retries_used: u32,
    },
    Failure {
        identifier: Identifier,
        error: ErrorKind,
        retries_used: u32,
        /// Whatever was collected before the failure.
        partial: Option<Record>,
    },
}

impl WorkOutcome {
    pub fn identifier(&self) -> &Identifier {
        match self {
            WorkOutcome::Success { record, .. } => &record.identifier,
            WorkOutcome::Failure { identifier, .. } => identifier,
        }
    }

    pub fn retries_used(&self) -> u32 {
        match self {
            WorkOutcome::Success { retries_used, .. } | WorkOutcome::Failure { retries_used, .. } => {
                *retries_used
            }
        }
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            WorkOutcome::Success { .. } => None,
            WorkOutcome::Failure { error, .. } => Some(*error),
        }
    }

    /// The record carried by this outcome, complete or partial.
    pub fn record(&self) -> Option<&Record> {
        match self {
            WorkOutcome::Success { record, .. } => Some(record),
            WorkOutcome::Failure { partial, .. } => partial.as_ref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success { .. })
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTermination {
    Completed,
    /// The session credential was rejected during the run.
    SessionExpired,
    Cancelled,
}

impl fmt::Display for RunTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTermination::Completed => write!(f, "completed"),
            RunTermination::SessionExpired => write!(f, "session_expired"),
            RunTermination::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Totals reported once every identifier has an outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    /// Outcomes carrying an incomplete record (truncated or failed mid-way).
    pub partial: usize,
    pub failed: usize,
    pub peak_in_flight: usize,
    pub termination: RunTermination,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
