//! Run orchestration: seeds the work queue, spawns the worker pool and turns
//! per-identifier results into a completion-ordered outcome stream.
//!
//! Every identifier in the job yields exactly one [`WorkOutcome`]. Identifiers
//! that never reached a worker (cancellation, dropped receiver, expired
//! session) are failed by the dispatcher itself once the pool has drained.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, JobConfig};
use crate::error::{AppError, ErrorKind};
use crate::governor::RateGovernor;
use crate::models::{Identifier, RunSummary, RunTermination, WorkOutcome};
use crate::paginator::Paginator;
use crate::session::SessionContext;
use crate::traits::ProfileFetcher;
use crate::worker::{RunStats, TracingReporter, WorkQueue, Worker, WorkerReporter};

/// The extraction engine.
///
/// Holds the fetcher, tuning and the rate governor, which is shared by every
/// run started from the same engine.
pub struct Engine<F, R: ?Sized = TracingReporter> {
    fetcher: F,
    config: EngineConfig,
    governor: RateGovernor,
    reporter: Arc<R>,
}

impl<F: ProfileFetcher> Engine<F, TracingReporter> {
    pub fn new(fetcher: F, config: EngineConfig) -> Result<Self, AppError> {
        config.validate()?;
        let governor = RateGovernor::new(config.governor.clone());
        Ok(Self {
            fetcher,
            config,
            governor,
            reporter: Arc::new(TracingReporter),
        })
    }
}

impl<F, R> Engine<F, R>
where
    F: ProfileFetcher,
    R: WorkerReporter + ?Sized + 'static,
{
    /// Replace the event reporter.
    pub fn with_reporter<R2: WorkerReporter + 'static>(self, reporter: R2) -> Engine<F, R2> {
        Engine {
            fetcher: self.fetcher,
            config: self.config,
            governor: self.governor,
            reporter: Arc::new(reporter),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// Start a run. Must be called from within a tokio runtime.
    ///
    /// Cancelling `cancel` stops workers from taking new identifiers; the
    /// stream still yields one outcome per identifier before it ends.
    pub fn run(&self, job: JobConfig, cancel: CancellationToken) -> OutcomeStream {
        let run_id = Uuid::new_v4();
        let session = SessionContext::new(job.credential().clone());
        let stats = Arc::new(RunStats::default());
        let capacity = self.config.output_buffer.unwrap_or(job.concurrency());
        let (tx, rx) = mpsc::channel(capacity);

        let paginator = Paginator::new(
            self.fetcher.clone(),
            session.clone(),
            self.governor.clone(),
            self.config.decoder.clone(),
            self.config.pagination.clone(),
        );

        let dispatcher = Dispatcher {
            run_id,
            job,
            session,
            paginator,
            stats: Arc::clone(&stats),
            reporter: Arc::clone(&self.reporter),
            cancel,
        };
        let handle = tokio::spawn(dispatcher.dispatch(tx));

        OutcomeStream {
            run_id,
            rx,
            handle,
            stats,
        }
    }
}

struct Dispatcher<F, R: ?Sized> {
    run_id: Uuid,
    job: JobConfig,
    session: SessionContext,
    paginator: Paginator<F>,
    stats: Arc<RunStats>,
    reporter: Arc<R>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    partial: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Success { .. } => self.succeeded += 1,
            WorkOutcome::Failure { .. } => self.failed += 1,
        }
        if outcome.record().is_some_and(|r| !r.complete) {
            self.partial += 1;
        }
    }
}

/// Counts an outcome unless its identifier was already reported.
fn accept(
    outcome: WorkOutcome,
    tally: &mut Tally,
    pending: &mut HashSet<Identifier>,
) -> Option<WorkOutcome> {
    if !pending.remove(outcome.identifier()) {
        tracing::error!(identifier = %outcome.identifier(), "Duplicate outcome dropped");
        return None;
    }
    tally.record(&outcome);
    Some(outcome)
}

impl<F, R> Dispatcher<F, R>
where
    F: ProfileFetcher,
    R: WorkerReporter + ?Sized + 'static,
{
    async fn dispatch(self, out: mpsc::Sender<WorkOutcome>) -> RunSummary {
        let started_at = Utc::now();
        let total = self.job.identifiers().len();
        let pool_size = self.job.concurrency().min(total);
        // Child token so a dropped receiver can stop the pool without
        // cancelling the caller's token.
        let cancel = self.cancel.child_token();

        tracing::info!(
            run_id = %self.run_id,
            total,
            concurrency = pool_size,
            "Starting extraction run"
        );

        let queue = WorkQueue::new(self.job.identifiers().iter().cloned());
        let (worker_tx, mut worker_rx) = mpsc::channel(pool_size.max(1));

        let mut pool = JoinSet::new();
        for id in 0..pool_size {
            let worker = Worker {
                id,
                paginator: self.paginator.clone(),
                queue: queue.clone(),
                outcomes: worker_tx.clone(),
                stats: Arc::clone(&self.stats),
                reporter: Arc::clone(&self.reporter),
                cancel: cancel.clone(),
                total,
            };
            pool.spawn(worker.run());
        }
        drop(worker_tx);

        let mut pending: HashSet<Identifier> = self.job.identifiers().iter().cloned().collect();
        let mut tally = Tally::default();
        let mut receiver_gone = false;

        while let Some(outcome) = worker_rx.recv().await {
            let Some(outcome) = accept(outcome, &mut tally, &mut pending) else {
                continue;
            };
            if !receiver_gone && out.send(outcome).await.is_err() {
                tracing::warn!(run_id = %self.run_id, "Outcome stream dropped; cancelling run");
                receiver_gone = true;
                cancel.cancel();
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task terminated abnormally");
            }
        }

        // Identifiers no worker picked up.
        let leftover_kind = if !self.session.is_valid() {
            ErrorKind::AuthExpired
        } else {
            ErrorKind::Cancelled
        };
        let mut leftovers: Vec<(Identifier, ErrorKind)> = queue
            .drain()
            .into_iter()
            .map(|id| (id, leftover_kind))
            .collect();

        // Anything still pending was lost with a crashed worker.
        let queued: HashSet<&Identifier> = leftovers.iter().map(|(id, _)| id).collect();
        let mut lost: Vec<Identifier> = pending
            .iter()
            .filter(|id| !queued.contains(id))
            .cloned()
            .collect();
        lost.sort();
        leftovers.extend(lost.into_iter().map(|id| (id, ErrorKind::Permanent)));

        for (identifier, error) in leftovers {
            let outcome = WorkOutcome::Failure {
                identifier,
                error,
                retries_used: 0,
                partial: None,
            };
            let Some(outcome) = accept(outcome, &mut tally, &mut pending) else {
                continue;
            };
            if !receiver_gone && out.send(outcome).await.is_err() {
                receiver_gone = true;
            }
        }

        let termination = if !self.session.is_valid() {
            RunTermination::SessionExpired
        } else if cancel.is_cancelled() {
            RunTermination::Cancelled
        } else {
            RunTermination::Completed
        };

        let summary = RunSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            total,
            succeeded: tally.succeeded,
            partial: tally.partial,
            failed: tally.failed,
            peak_in_flight: self.stats.peak_in_flight(),
            termination,
        };

        tracing::info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            termination = %summary.termination,
            "Processing complete"
        );
        summary
    }
}

/// Completion-ordered stream of outcomes for one run.
///
/// Backed by a bounded channel: if the consumer stops reading, workers stop
/// after their current identifier until it resumes.
pub struct OutcomeStream {
    run_id: Uuid,
    rx: mpsc::Receiver<WorkOutcome>,
    handle: JoinHandle<RunSummary>,
    stats: Arc<RunStats>,
}

impl OutcomeStream {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Next outcome in completion order, or `None` once every identifier has
    /// been reported.
    pub async fn next(&mut self) -> Option<WorkOutcome> {
        self.rx.recv().await
    }

    /// Waits for the run to end, discarding outcomes not yet received.
    pub async fn finish(mut self) -> Result<RunSummary, AppError> {
        let mut discarded = 0usize;
        while self.rx.recv().await.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(run_id = %self.run_id, discarded, "Discarded unread outcomes");
        }
        self.handle
            .await
            .map_err(|e| AppError::Engine(format!("dispatcher task failed: {e}")))
    }

    /// Collects every remaining outcome, then the summary.
    pub async fn collect(mut self) -> Result<(Vec<WorkOutcome>, RunSummary), AppError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.rx.recv().await {
            outcomes.push(outcome);
        }
        let summary = self.finish().await?;
        Ok((outcomes, summary))
    }
}
