//! Test utilities: a scripted [`ProfileFetcher`] and response builders.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All state lives behind `Arc<Mutex<_>>` / atomics so tests can assert on
//! recorded calls after the engine has run.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::FetchError;
use crate::models::{Cursor, Identifier};
use crate::traits::{FetchRequest, ProfileFetcher, RawResponse};

type Script = VecDeque<Result<Value, FetchError>>;

/// Builds a web-profile response body with one page of timeline items.
pub fn profile_page(ids: &[&str], next: Option<&str>) -> Value {
    let edges: Vec<Value> = ids
        .iter()
        .map(|id| json!({"node": {"id": id, "shortcode": format!("sc{id}")}}))
        .collect();
    json!({
        "data": {"user": {
            "username": "stub",
            "edge_owner_to_timeline_media": {
                "count": ids.len(),
                "page_info": {"has_next_page": next.is_some(), "end_cursor": next},
                "edges": edges
            }
        }}
    })
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with scripted responses.
///
/// Responses are taken from the identifier's own script when one exists,
/// otherwise from the shared queue. When both are empty a single final page
/// with no items is returned.
#[derive(Clone, Default)]
pub struct MockFetcher {
    shared: Arc<Mutex<Script>>,
    scripts: Arc<Mutex<HashMap<Identifier, Script>>>,
    calls: Arc<Mutex<Vec<(Identifier, Cursor)>>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<Value, FetchError>>) -> Self {
        let fetcher = Self::default();
        *fetcher.shared.lock().unwrap() = responses.into();
        fetcher
    }

    /// Script the responses for one identifier.
    pub fn with_script(self, identifier: &str, responses: Vec<Result<Value, FetchError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(Identifier::from(identifier), responses.into());
        self
    }

    /// Simulated network latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<(Identifier, Cursor)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn fetched(&self, identifier: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|(id, _)| id.as_str() == identifier)
    }

    /// Highest number of overlapping `fetch` calls.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_response(&self, identifier: &Identifier) -> Result<Value, FetchError> {
        if let Some(script) = self.scripts.lock().unwrap().get_mut(identifier)
            && let Some(response) = script.pop_front()
        {
            return response;
        }
        self.shared
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(profile_page(&[], None)))
    }
}

impl ProfileFetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, FetchError> {
        if request.credential().is_none() {
            return Err(FetchError::AuthExpired("no credential attached".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push((request.identifier.clone(), request.cursor.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.next_response(&request.identifier).map(RawResponse::new)
    }
}
