//! Session credential and its process-wide liveness flag.
//!
//! Every outgoing request passes through [`SessionContext::attach`], which is
//! the only place a credential is handed to a fetcher. Once any worker calls
//! [`SessionContext::invalidate`], `attach` refuses, so no request can leave
//! after an authentication failure has been observed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::FetchError;
use crate::traits::FetchRequest;

/// Opaque session secret (e.g. a cookie header value).
///
/// `Debug` and `Display` never print the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(secret: impl AsRef<str>) -> Self {
        Self(Arc::from(secret.as_ref()))
    }

    /// Exposes the raw secret. Only fetchers should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<redacted, {} bytes>)", self.0.len())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Shared credential plus the valid/invalidated flag.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Debug, Clone)]
pub struct SessionContext {
    credential: Credential,
    invalidated: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            invalidated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.invalidated.load(Ordering::Acquire)
    }

    /// Marks the session as invalidated.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn invalidate(&self) -> bool {
        let flipped = self
            .invalidated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            tracing::error!(
                "Session credential rejected; no further requests will be issued. \
                 Provide fresh session cookies."
            );
        }
        flipped
    }

    /// Injects the credential into an outgoing request.
    pub fn attach(&self, request: FetchRequest) -> Result<FetchRequest, FetchError> {
        if !self.is_valid() {
            return Err(FetchError::AuthExpired(
                "session invalidated earlier in this run".into(),
            ));
        }
        Ok(request.with_credential(self.credential.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cursor, Identifier};

    fn request() -> FetchRequest {
        FetchRequest::new(Identifier::from("alice"), Cursor::Start)
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::new("sessionid=super-secret");
        assert!(!format!("{cred:?}").contains("super-secret"));
        assert_eq!(cred.to_string(), "<redacted>");
        assert_eq!(cred.expose(), "sessionid=super-secret");
    }

    #[test]
    fn attach_injects_credential() {
        let session = SessionContext::new(Credential::new("cookie"));
        let req = session.attach(request()).unwrap();
        assert_eq!(req.credential().map(Credential::expose), Some("cookie"));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let session = SessionContext::new(Credential::new("cookie"));
        assert!(session.is_valid());
        assert!(session.invalidate());
        assert!(!session.invalidate());
        assert!(!session.is_valid());
    }

    #[test]
    fn attach_fails_fast_after_invalidation() {
        let session = SessionContext::new(Credential::new("cookie"));
        let clone = session.clone();
        clone.invalidate();
        let err = session.attach(request()).unwrap_err();
        assert!(matches!(err, FetchError::AuthExpired(_)));
    }

    #[test]
    fn concurrent_invalidation_flips_once() {
        let session = SessionContext::new(Credential::new("cookie"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = session.clone();
                std::thread::spawn(move || s.invalidate())
            })
            .collect();
        let flips = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|flipped| *flipped)
            .count();
        assert_eq!(flips, 1);
    }
}
