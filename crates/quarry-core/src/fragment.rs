//! Decoding of GraphQL profile responses into [`PageFragment`]s.
//!
//! Expected shape:
//!
//! ```text
//! { "data": { "user": {
//!       ...profile fields...,
//!       "<connection>": {
//!           "count": 120,
//!           "page_info": { "has_next_page": true, "end_cursor": "QVFE..." },
//!           "edges": [ { "node": { "id": "3141", ... } }, ... ]
//!       } } },
//!   "extensions": { "authoritative": false } }
//! ```
//!
//! The connection's `edges` and `page_info` are lifted out of the profile
//! fields; everything else on the user object is kept as-is.

use serde_json::{Map, Value};

use crate::error::FetchError;
use crate::models::{Cursor, PageFragment, RawItem};
use crate::traits::RawResponse;

/// Timeline connection on the web profile endpoint.
pub const DEFAULT_CONNECTION: &str = "edge_owner_to_timeline_media";

/// Turns raw response bodies into page fragments.
#[derive(Debug, Clone)]
pub struct FragmentDecoder {
    connection: String,
}

impl Default for FragmentDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION)
    }
}

impl FragmentDecoder {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
        }
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn decode(&self, raw: &RawResponse) -> Result<PageFragment, FetchError> {
        let body = raw
            .body
            .as_object()
            .ok_or_else(|| FetchError::Malformed("response body is not a JSON object".into()))?;

        check_status_markers(body)?;

        let mut fields = body
            .get("data")
            .and_then(|d| d.get("user"))
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| FetchError::Malformed("user object not found in API response".into()))?;

        let authoritative = body
            .get("extensions")
            .and_then(|e| e.get("authoritative"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let Some(connection) = fields.get_mut(&self.connection) else {
            // Profiles without the connection are a single, final page.
            return Ok(PageFragment {
                cursor: Cursor::End,
                items: Vec::new(),
                has_next: false,
                fields,
                authoritative,
            });
        };

        let connection = connection.as_object_mut().ok_or_else(|| {
            FetchError::Malformed(format!("'{}' is not an object", self.connection))
        })?;

        let items = match connection.remove("edges") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(edges)) => edges.into_iter().map(edge_to_item).collect(),
            Some(_) => {
                return Err(FetchError::Malformed(format!(
                    "'{}.edges' is not an array",
                    self.connection
                )));
            }
        };

        let page_info = connection.remove("page_info").unwrap_or(Value::Null);
        let has_next = page_info
            .get("has_next_page")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let end_cursor = page_info
            .get("end_cursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty());

        let cursor = match (has_next, end_cursor) {
            (true, Some(c)) => Cursor::Token(c.to_string()),
            (true, None) => {
                return Err(FetchError::Malformed(
                    "has_next_page is true but end_cursor is missing".into(),
                ));
            }
            (false, _) => Cursor::End,
        };

        Ok(PageFragment {
            cursor,
            items,
            has_next,
            fields,
            authoritative,
        })
    }
}

/// Service-level error markers delivered with a 200 status.
fn check_status_markers(body: &Map<String, Value>) -> Result<(), FetchError> {
    if body.get("require_login").and_then(Value::as_bool) == Some(true) {
        return Err(FetchError::AuthExpired("login required".into()));
    }
    if body.get("status").and_then(Value::as_str) == Some("fail") {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let lowered = message.to_lowercase();
        if lowered.contains("wait a few minutes") || lowered.contains("rate limit") {
            return Err(FetchError::Throttled { retry_after: None });
        }
        if lowered.contains("login") || lowered.contains("checkpoint") {
            return Err(FetchError::AuthExpired(message.to_string()));
        }
    }
    Ok(())
}

fn edge_to_item(edge: Value) -> RawItem {
    let node = match edge {
        Value::Object(mut map) => match map.remove("node") {
            Some(node) => node,
            None => Value::Object(map),
        },
        other => other,
    };
    let key = match node.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    RawItem::new(key, node)
}
