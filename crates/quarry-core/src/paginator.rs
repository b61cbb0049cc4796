//! Cursor-driven page fetching for a single identifier.
//!
//! # States
//!
//! ```text
//! INIT --> FETCHING --[has_next, below ceiling]--> CONTINUING --> FETCHING
//!             |  ^
//!             |  +--[throttled / transient, budget left]
//!             |
//!             +--[last page or ceiling]--> DONE
//!             +--[fatal error or budget spent]--> FAILED
//! ```
//!
//! Pages are strictly sequential: cursor N+1 comes from page N.

use tokio_util::sync::CancellationToken;

use crate::assembler::RecordAssembler;
use crate::config::PaginationConfig;
use crate::error::{ErrorKind, FetchError};
use crate::fragment::FragmentDecoder;
use crate::governor::RateGovernor;
use crate::models::{Cursor, Identifier, WorkOutcome};
use crate::session::SessionContext;
use crate::traits::{FetchRequest, ProfileFetcher};
use crate::worker::{EngineEvent, WorkerReporter};

/// Position of one identifier in the pagination state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    Init,
    /// About to request the page at this cursor (possibly again, after a retry).
    Fetching(Cursor),
    Continuing(Cursor),
    Done {
        /// False when a page ceiling stopped pagination early.
        complete: bool,
    },
    Failed(ErrorKind),
}

impl PageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageState::Done { .. } | PageState::Failed(_))
    }
}

/// Everything one identifier produced, ready to become a [`WorkOutcome`].
#[derive(Debug)]
pub struct PageRun {
    pub identifier: Identifier,
    pub assembler: RecordAssembler,
    pub retries_used: u32,
    pub state: PageState,
}

impl PageRun {
    pub fn into_outcome(self) -> WorkOutcome {
        match self.state {
            PageState::Done { complete } => WorkOutcome::Success {
                record: self.assembler.finish(complete),
                retries_used: self.retries_used,
            },
            PageState::Failed(error) => WorkOutcome::Failure {
                identifier: self.identifier,
                error,
                retries_used: self.retries_used,
                partial: self
                    .assembler
                    .has_fragments()
                    .then(|| self.assembler.finish(false)),
            },
            // run() only returns terminal states
            state => {
                tracing::error!(
                    identifier = %self.identifier,
                    ?state,
                    "Pagination stopped in a non-terminal state"
                );
                WorkOutcome::Failure {
                    identifier: self.identifier,
                    error: ErrorKind::Cancelled,
                    retries_used: self.retries_used,
                    partial: self
                        .assembler
                        .has_fragments()
                        .then(|| self.assembler.finish(false)),
                }
            }
        }
    }
}

/// Drives the state machine for one identifier at a time.
///
/// Cheap to clone; every worker owns one.
#[derive(Debug, Clone)]
pub struct Paginator<F> {
    fetcher: F,
    session: SessionContext,
    governor: RateGovernor,
    decoder: FragmentDecoder,
    config: PaginationConfig,
}

impl<F: ProfileFetcher> Paginator<F> {
    pub fn new(
        fetcher: F,
        session: SessionContext,
        governor: RateGovernor,
        decoder: FragmentDecoder,
        config: PaginationConfig,
    ) -> Self {
        Self {
            fetcher,
            session,
            governor,
            decoder,
            config,
        }
    }

    /// Drops per-identifier pacing state once the identifier is finished.
    pub fn release(&self, identifier: &Identifier) {
        self.governor.release(identifier);
    }

    /// Fetches every page for `identifier` until done, failed or cancelled.
    ///
    /// An in-flight fetch is never aborted; cancellation is observed between
    /// pages and while waiting for admission or backoff.
    pub async fn run<R: WorkerReporter + ?Sized>(
        &self,
        identifier: &Identifier,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> PageRun {
        let mut assembler = RecordAssembler::new(identifier.clone());
        let mut retries_used = 0;
        let mut state = PageState::Init;

        while !state.is_terminal() {
            state = match state {
                PageState::Init => PageState::Fetching(Cursor::Start),
                PageState::Continuing(cursor) => PageState::Fetching(cursor),
                PageState::Fetching(cursor) => {
                    self.fetch_page(
                        identifier,
                        cursor,
                        &mut assembler,
                        &mut retries_used,
                        cancel,
                        reporter,
                    )
                    .await
                }
                terminal => terminal,
            };
        }

        PageRun {
            identifier: identifier.clone(),
            assembler,
            retries_used,
            state,
        }
    }

    async fn fetch_page<R: WorkerReporter + ?Sized>(
        &self,
        identifier: &Identifier,
        cursor: Cursor,
        assembler: &mut RecordAssembler,
        retries_used: &mut u32,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> PageState {
        if cancel.is_cancelled() {
            return PageState::Failed(ErrorKind::Cancelled);
        }
        if !self.session.is_valid() {
            return PageState::Failed(ErrorKind::AuthExpired);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return PageState::Failed(ErrorKind::Cancelled),
            _ = self.governor.admit(identifier) => {}
        }

        let result = match self
            .session
            .attach(FetchRequest::new(identifier.clone(), cursor.clone()))
        {
            Ok(request) => match self.fetcher.fetch(&request).await {
                Ok(raw) => self.decoder.decode(&raw),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let fragment = match result {
            Ok(fragment) => fragment,
            Err(err) => {
                return self
                    .handle_error(err, identifier, cursor, retries_used, cancel, reporter)
                    .await;
            }
        };

        let has_next = fragment.has_next;
        let next = fragment.cursor.clone();
        let items = fragment.items.len();
        // Items of a page that repeats its cursor are kept for the partial
        // record, but the page does not count as a success.
        assembler.fold_in_place(fragment);

        if has_next && next == cursor {
            tracing::warn!(identifier = %identifier, "Cursor did not advance");
            return PageState::Failed(ErrorKind::Malformed);
        }
        self.governor.report_success();

        reporter.report(EngineEvent::PageFetched {
            identifier,
            page: assembler.pages(),
            items,
            has_next,
        });

        if !has_next {
            return PageState::Done { complete: true };
        }
        if assembler.pages() >= self.config.page_limit() {
            tracing::warn!(
                identifier = %identifier,
                pages = assembler.pages(),
                "Page ceiling reached; record is incomplete"
            );
            return PageState::Done { complete: false };
        }
        PageState::Continuing(next)
    }

    async fn handle_error<R: WorkerReporter + ?Sized>(
        &self,
        err: FetchError,
        identifier: &Identifier,
        cursor: Cursor,
        retries_used: &mut u32,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> PageState {
        let kind = err.kind();

        if kind == ErrorKind::AuthExpired {
            if self.session.invalidate() {
                reporter.report(EngineEvent::SessionInvalidated { identifier });
            }
            return PageState::Failed(kind);
        }

        if !err.is_retryable() {
            tracing::warn!(identifier = %identifier, error = %err, "Non-retryable fetch error");
            return PageState::Failed(kind);
        }

        // Every throttle starts the shared cooldown, retried or not.
        let cooldown = match &err {
            FetchError::Throttled { retry_after } => Some(self.governor.report_throttle(*retry_after)),
            _ => None,
        };

        if *retries_used >= self.config.max_retries {
            tracing::warn!(
                identifier = %identifier,
                error = %err,
                retries = *retries_used,
                "Retry budget exhausted"
            );
            return PageState::Failed(kind);
        }

        let attempt = *retries_used;
        *retries_used += 1;

        let delay = cooldown.unwrap_or_else(|| self.governor.retry_delay(attempt));

        reporter.report(EngineEvent::RetryScheduled {
            identifier,
            kind,
            attempt: *retries_used,
            delay,
        });

        // Throttles are waited out at the next admission (shared cooldown);
        // transient errors back off here.
        if kind == ErrorKind::Transient {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return PageState::Failed(ErrorKind::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        PageState::Fetching(cursor)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::governor::GovernorConfig;
    use crate::session::Credential;
    use crate::testutil::{MockFetcher, profile_page};
    use crate::worker::NullReporter;

    fn paginator(fetcher: MockFetcher, config: PaginationConfig) -> (Paginator<MockFetcher>, SessionContext) {
        let session = SessionContext::new(Credential::new("cookie"));
        let governor = RateGovernor::new(
            GovernorConfig::default()
                .with_rate(1000.0, 1000)
                .with_backoff(Duration::from_millis(100), Duration::from_secs(5))
                .with_jitter(Duration::ZERO),
        );
        let p = Paginator::new(
            fetcher,
            session.clone(),
            governor,
            FragmentDecoder::default(),
            config,
        );
        (p, session)
    }

    async fn run(p: &Paginator<MockFetcher>, id: &str) -> PageRun {
        p.run(&Identifier::from(id), &CancellationToken::new(), &NullReporter)
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn follows_cursors_until_last_page() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(profile_page(&["1", "2", "3"], Some("c1"))),
            Ok(profile_page(&["4", "5"], None)),
        ]);
        let (p, _) = paginator(fetcher.clone(), PaginationConfig::default());
        let run = run(&p, "alice").await;

        assert_eq!(run.state, PageState::Done { complete: true });
        assert_eq!(run.assembler.item_count(), 5);
        let cursors: Vec<_> = fetcher.calls().into_iter().map(|(_, c)| c).collect();
        assert_eq!(cursors, [Cursor::Start, Cursor::Token("c1".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_are_retried_with_growing_delay() {
        let fetcher = MockFetcher::with_responses(vec![
            Err(FetchError::Throttled { retry_after: None }),
            Err(FetchError::Throttled { retry_after: None }),
            Ok(profile_page(&["1"], None)),
        ]);
        let (p, _) = paginator(fetcher.clone(), PaginationConfig::default());

        let start = Instant::now();
        let run = run(&p, "alice").await;

        assert_eq!(run.state, PageState::Done { complete: true });
        assert_eq!(run.retries_used, 2);
        // 100ms then 200ms of cooldown
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(fetcher.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_budget() {
        let fetcher = MockFetcher::with_responses(
            (0..10)
                .map(|_| Err(FetchError::Transient("timeout".into())))
                .collect(),
        );
        let config = PaginationConfig {
            max_retries: 3,
            ..Default::default()
        };
        let (p, _) = paginator(fetcher.clone(), config);
        let run = run(&p, "alice").await;

        assert_eq!(run.state, PageState::Failed(ErrorKind::Transient));
        assert_eq!(run.retries_used, 3);
        assert_eq!(fetcher.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_page_keeps_earlier_items() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(profile_page(&["1", "2"], Some("c1"))),
            Err(FetchError::Malformed("truncated json".into())),
        ]);
        let (p, _) = paginator(fetcher, PaginationConfig::default());
        let outcome = run(&p, "alice").await.into_outcome();

        match outcome {
            WorkOutcome::Failure { error, partial, .. } => {
                assert_eq!(error, ErrorKind::Malformed);
                let partial = partial.expect("partial record");
                assert!(!partial.complete);
                assert_eq!(partial.item_count, 2);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_invalidates_session() {
        let fetcher = MockFetcher::with_responses(vec![Err(FetchError::AuthExpired("401".into()))]);
        let (p, session) = paginator(fetcher.clone(), PaginationConfig::default());

        let outcome = run(&p, "alice").await.into_outcome();
        assert_eq!(outcome.error(), Some(ErrorKind::AuthExpired));
        assert!(outcome.record().is_none());
        assert!(!session.is_valid());

        // a second identifier fails fast without touching the network
        let outcome = run(&p, "bob").await.into_outcome();
        assert_eq!(outcome.error(), Some(ErrorKind::AuthExpired));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_ceiling_marks_record_incomplete() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(profile_page(&["1"], Some("c1"))),
            Ok(profile_page(&["2"], Some("c2"))),
            Ok(profile_page(&["3"], Some("c3"))),
        ]);
        let config = PaginationConfig {
            max_pages: Some(2),
            ..Default::default()
        };
        let (p, _) = paginator(fetcher.clone(), config);
        let outcome = run(&p, "alice").await.into_outcome();

        assert!(outcome.is_success());
        let record = outcome.record().unwrap();
        assert!(!record.complete);
        assert_eq!(record.pages, 2);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_cursor_is_malformed_but_keeps_items() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(profile_page(&["1"], Some("same"))),
            Err(FetchError::Throttled { retry_after: None }),
            Ok(profile_page(&["2"], Some("same"))),
        ]);
        let (p, _) = paginator(fetcher, PaginationConfig::default());
        let run = run(&p, "alice").await;
        assert_eq!(run.state, PageState::Failed(ErrorKind::Malformed));
        assert_eq!(run.assembler.item_count(), 2);
        // the stuck page did not clear the throttle streak
        assert_eq!(p.governor.stats().consecutive_throttles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn final_throttle_still_starts_cooldown() {
        let fetcher = MockFetcher::with_responses(vec![Err(FetchError::Throttled {
            retry_after: None,
        })]);
        let config = PaginationConfig {
            max_retries: 0,
            ..Default::default()
        };
        let (p, _) = paginator(fetcher, config);
        let run = run(&p, "alice").await;

        assert_eq!(run.state, PageState::Failed(ErrorKind::Throttled));
        let stats = p.governor.stats();
        assert_eq!(stats.consecutive_throttles, 1);
        assert!(stats.cooldown_remaining.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_page_finishes_page_then_stops() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(profile_page(&["1", "2"], Some("c1"))),
            Ok(profile_page(&["3"], None)),
        ])
        .with_latency(Duration::from_millis(100));
        let (p, _) = paginator(fetcher.clone(), PaginationConfig::default());
        let cancel = CancellationToken::new();
        let trigger = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };

        let alice = Identifier::from("alice");
        let (run, ()) = tokio::join!(
            p.run(&alice, &cancel, &NullReporter),
            trigger
        );
        assert_eq!(fetcher.call_count(), 1);

        let outcome = run.into_outcome();
        assert_eq!(outcome.error(), Some(ErrorKind::Cancelled));
        let partial = outcome.record().expect("partial record");
        assert!(!partial.complete);
        assert_eq!(partial.item_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let fetcher = MockFetcher::with_responses(vec![Err(FetchError::Permanent {
            status: 404,
            message: "user not found".into(),
        })]);
        let (p, _) = paginator(fetcher.clone(), PaginationConfig::default());
        let run = run(&p, "ghost").await;
        assert_eq!(run.state, PageState::Failed(ErrorKind::Permanent));
        assert_eq!(run.retries_used, 0);
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_never_fetches() {
        let fetcher = MockFetcher::with_responses(vec![Ok(json!({}))]);
        let (p, _) = paginator(fetcher.clone(), PaginationConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = p.run(&Identifier::from("alice"), &cancel, &NullReporter).await;
        assert_eq!(run.state, PageState::Failed(ErrorKind::Cancelled));
        assert_eq!(fetcher.call_count(), 0);
    }
}
