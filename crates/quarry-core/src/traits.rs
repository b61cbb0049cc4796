use std::future::Future;

use serde_json::Value;

use crate::error::FetchError;
use crate::models::{Cursor, Identifier};
use crate::session::Credential;

/// One outgoing page request.
///
/// Built by the paginator, then passed through
/// [`SessionContext::attach`](crate::session::SessionContext::attach) which
/// fills in the credential.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub identifier: Identifier,
    pub cursor: Cursor,
    credential: Option<Credential>,
}

impl FetchRequest {
    pub fn new(identifier: Identifier, cursor: Cursor) -> Self {
        Self {
            identifier,
            cursor,
            credential: None,
        }
    }

    pub(crate) fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}

/// Undecoded response body of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub body: Value,
}

impl RawResponse {
    pub fn new(body: Value) -> Self {
        Self { body }
    }
}

/// Fetches one page of profile data for an identifier.
///
/// Implementations translate their transport failures into the
/// [`FetchError`] taxonomy; the engine decides what to retry.
pub trait ProfileFetcher: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<RawResponse, FetchError>> + Send;
}
