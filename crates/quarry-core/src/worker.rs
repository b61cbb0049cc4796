use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::models::{Identifier, WorkOutcome};
use crate::paginator::Paginator;
use crate::traits::ProfileFetcher;

/// Events emitted by workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum EngineEvent<'a> {
    WorkerStarted {
        worker_id: usize,
    },
    IdentifierStarted {
        worker_id: usize,
        identifier: &'a Identifier,
    },
    PageFetched {
        identifier: &'a Identifier,
        page: u32,
        items: usize,
        has_next: bool,
    },
    RetryScheduled {
        identifier: &'a Identifier,
        kind: ErrorKind,
        attempt: u32,
        delay: Duration,
    },
    SessionInvalidated {
        identifier: &'a Identifier,
    },
    IdentifierFinished {
        outcome: &'a WorkOutcome,
        processed: usize,
        total: usize,
    },
    WorkerStopped {
        worker_id: usize,
        processed: usize,
    },
}

/// Trait for receiving engine events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: EngineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl WorkerReporter for NullReporter {}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl WorkerReporter for TracingReporter {
    fn report(&self, event: EngineEvent<'_>) {
        match event {
            EngineEvent::WorkerStarted { worker_id } => {
                tracing::debug!(%worker_id, "Worker started");
            }
            EngineEvent::IdentifierStarted {
                worker_id,
                identifier,
            } => {
                tracing::debug!(%worker_id, %identifier, "Processing identifier");
            }
            EngineEvent::PageFetched {
                identifier,
                page,
                items,
                has_next,
            } => {
                tracing::debug!(%identifier, %page, %items, %has_next, "Page fetched");
            }
            EngineEvent::RetryScheduled {
                identifier,
                kind,
                attempt,
                delay,
            } => {
                tracing::warn!(
                    %identifier,
                    %kind,
                    %attempt,
                    delay_ms = %delay.as_millis(),
                    "Retrying"
                );
            }
            EngineEvent::SessionInvalidated { identifier } => {
                tracing::error!(%identifier, "Authentication failed; session invalidated");
            }
            EngineEvent::IdentifierFinished {
                outcome,
                processed,
                total,
            } => {
                let identifier = outcome.identifier();
                match outcome {
                    WorkOutcome::Success { record, .. } => {
                        tracing::info!(
                            items = record.item_count,
                            complete = record.complete,
                            "{processed}/{total} -> {identifier} ok"
                        );
                    }
                    WorkOutcome::Failure { error, partial, .. } => {
                        tracing::warn!(
                            %error,
                            partial_items = partial.as_ref().map_or(0, |r| r.item_count),
                            "{processed}/{total} -> {identifier} failed"
                        );
                    }
                }
            }
            EngineEvent::WorkerStopped {
                worker_id,
                processed,
            } => {
                tracing::debug!(%worker_id, %processed, "Worker stopped");
            }
        }
    }
}

/// Identifiers waiting for a worker, in input order.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkQueue {
    inner: Arc<Mutex<VecDeque<Identifier>>>,
}

impl WorkQueue {
    pub(crate) fn new(identifiers: impl IntoIterator<Item = Identifier>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(identifiers.into_iter().collect())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Identifier>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn pop(&self) -> Option<Identifier> {
        self.lock().pop_front()
    }

    /// Removes and returns everything still queued.
    pub(crate) fn drain(&self) -> Vec<Identifier> {
        self.lock().drain(..).collect()
    }
}

/// Live counters for one run.
#[derive(Debug, Default)]
pub struct RunStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    processed: AtomicUsize,
}

impl RunStats {
    /// Identifiers currently being paginated.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` value observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Identifiers finished by workers.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { stats: self }
    }
}

struct InFlightGuard<'a> {
    stats: &'a RunStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One executor of the pool: pulls identifiers until the queue is empty or
/// the run is cancelled.
pub(crate) struct Worker<F, R: ?Sized> {
    pub(crate) id: usize,
    pub(crate) paginator: Paginator<F>,
    pub(crate) queue: WorkQueue,
    pub(crate) outcomes: mpsc::Sender<WorkOutcome>,
    pub(crate) stats: Arc<RunStats>,
    pub(crate) reporter: Arc<R>,
    pub(crate) cancel: CancellationToken,
    pub(crate) total: usize,
}

impl<F, R> Worker<F, R>
where
    F: ProfileFetcher,
    R: WorkerReporter + ?Sized,
{
    /// Returns the number of identifiers this worker processed.
    pub(crate) async fn run(self) -> usize {
        self.reporter
            .report(EngineEvent::WorkerStarted { worker_id: self.id });

        let mut processed = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(identifier) = self.queue.pop() else {
                break;
            };

            self.reporter.report(EngineEvent::IdentifierStarted {
                worker_id: self.id,
                identifier: &identifier,
            });

            let outcome = {
                let _guard = self.stats.enter();
                self.paginator
                    .run(&identifier, &self.cancel, self.reporter.as_ref())
                    .await
                    .into_outcome()
            };
            self.paginator.release(&identifier);
            processed += 1;

            let done = self.stats.processed.fetch_add(1, Ordering::SeqCst) + 1;
            self.reporter.report(EngineEvent::IdentifierFinished {
                outcome: &outcome,
                processed: done,
                total: self.total,
            });

            if self.outcomes.send(outcome).await.is_err() {
                tracing::warn!(worker_id = self.id, "Outcome receiver dropped; stopping");
                break;
            }
        }

        self.reporter.report(EngineEvent::WorkerStopped {
            worker_id: self.id,
            processed,
        });
        processed
    }
}
