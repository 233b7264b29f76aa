//! Resumable, concurrent extraction over a row sequence.
//!
//! A run has three cooperating parts:
//!
//! * the **dispatcher** feeds pending rows into a bounded work queue,
//!   consulting the resource governor every `throttle_every` rows;
//! * **workers** each own one session, pull rows from the shared queue and
//!   run the extractor under the retry policy;
//! * the **aggregator** is the only writer of the checkpoint: it records
//!   every outcome and saves every `save_every` outcomes.
//!
//! The checkpoint is flushed once more when the pool drains, whether the
//! run finished, was cancelled or lost its sessions. The final result is
//! rebuilt from the checkpoint in input order, so rows completed by an
//! earlier run appear exactly as they did then.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::error::AppError;
use crate::governor::{GovernorConfig, ResourceGovernor};
use crate::models::{ContactInfo, Row, RowResult, RowStatus, RunResult, RunSummary};
use crate::retry::{ErrorContext, ErrorTracker, RetryPolicy};
use crate::traits::{Extractor, Session, SessionFactory};

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Events emitted during a run.
#[derive(Debug)]
pub enum RunEvent<'a> {
    Started {
        job: &'a str,
        total: usize,
        already_completed: usize,
        pending: usize,
        workers: usize,
    },
    /// The checkpoint marks the job finished; nothing is dispatched.
    AlreadyCompleted {
        job: &'a str,
    },
    WorkerStarted {
        worker_id: usize,
    },
    WorkerStopped {
        worker_id: usize,
        processed: usize,
    },
    /// A worker found the row already completed and did not extract it.
    RowSkipped {
        index: usize,
    },
    RowCompleted {
        index: usize,
        target: &'a str,
        contacts: &'a ContactInfo,
    },
    RowFailed {
        index: usize,
        target: &'a str,
        error: &'a AppError,
    },
    Throttled {
        dispatched: usize,
    },
    CheckpointSaved {
        completed: usize,
        total: usize,
    },
    Interrupted {
        unrecorded: usize,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Receives run events. All methods default to no-ops.
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Started {
                job,
                total,
                already_completed,
                pending,
                workers,
            } => {
                tracing::info!(%job, total, already_completed, pending, workers, "Run started");
            }
            RunEvent::AlreadyCompleted { job } => {
                tracing::info!(%job, "Job already completed, nothing to dispatch");
            }
            RunEvent::WorkerStarted { worker_id } => {
                tracing::debug!(worker_id, "Worker started");
            }
            RunEvent::WorkerStopped {
                worker_id,
                processed,
            } => {
                tracing::debug!(worker_id, processed, "Worker stopped");
            }
            RunEvent::RowSkipped { index } => {
                tracing::debug!(row = index, "Row already completed, skipping");
            }
            RunEvent::RowCompleted {
                index,
                target,
                contacts,
            } => {
                tracing::info!(
                    row = index,
                    %target,
                    emails = contacts.emails.len(),
                    social = contacts.social_links.values().map(Vec::len).sum::<usize>(),
                    "Row completed"
                );
            }
            RunEvent::RowFailed {
                index,
                target,
                error,
            } => {
                tracing::warn!(row = index, %target, kind = error.kind(), %error, "Row failed");
            }
            RunEvent::Throttled { dispatched } => {
                tracing::info!(dispatched, "Dispatch throttled by resource governor");
            }
            RunEvent::CheckpointSaved { completed, total } => {
                tracing::info!(completed, total, "Checkpoint saved");
            }
            RunEvent::Interrupted { unrecorded } => {
                tracing::warn!(unrecorded, "Run interrupted, progress saved");
            }
            RunEvent::Finished { summary } => {
                tracing::info!(
                    job = %summary.job_name,
                    completed = summary.completed,
                    failed = summary.failed,
                    pending = summary.pending,
                    most_common_error = summary.most_common_error.as_deref().unwrap_or("none"),
                    elapsed_secs = summary.elapsed.as_secs_f64(),
                    "Run finished"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent workers (and sessions).
    pub workers: usize,
    /// Per-attempt page load timeout handed to the extractor.
    pub page_timeout: Duration,
    pub checkpoint_dir: PathBuf,
    /// Save the checkpoint after this many recorded outcomes. 0 disables periodic saves.
    pub save_every: usize,
    /// Consult the governor before every n-th dispatch. 0 disables throttling.
    pub throttle_every: usize,
    pub throttle_pause: Duration,
    /// Only process the first n rows.
    pub test_limit: Option<usize>,
    /// Discard existing progress before the run.
    pub fresh: bool,
    /// Re-open a completed job so its failed rows are retried.
    pub retry_failed: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            page_timeout: Duration::from_secs(15),
            checkpoint_dir: PathBuf::from("checkpoints"),
            save_every: 5,
            throttle_every: 10,
            throttle_pause: Duration::from_secs(1),
            test_limit: None,
            fresh: false,
            retry_failed: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_save_every(mut self, n: usize) -> Self {
        self.save_every = n;
        self
    }

    pub fn with_throttle_every(mut self, n: usize) -> Self {
        self.throttle_every = n;
        self
    }

    pub fn with_throttle_pause(mut self, pause: Duration) -> Self {
        self.throttle_pause = pause;
        self
    }

    pub fn with_test_limit(mut self, limit: Option<usize>) -> Self {
        self.test_limit = limit;
        self
    }

    pub fn with_fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }
}

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

struct Dispatch {
    index: usize,
    target: String,
}

enum Outcome {
    Completed(ContactInfo),
    Failed(AppError),
    AlreadyCompleted,
    /// Cancelled before an outcome could be recorded; the row stays pending.
    Interrupted,
}

enum WorkerMessage {
    SessionOpened,
    SessionFailed(AppError),
    Row {
        index: usize,
        target: String,
        outcome: Outcome,
    },
}

type SharedStore = Arc<RwLock<CheckpointStore>>;

fn read_store(store: &SharedStore) -> RwLockReadGuard<'_, CheckpointStore> {
    store.read().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned checkpoint lock");
        poisoned.into_inner()
    })
}

fn write_store(store: &SharedStore) -> RwLockWriteGuard<'_, CheckpointStore> {
    store.write().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned checkpoint lock");
        poisoned.into_inner()
    })
}

/// Serialize the record under the lock, then write it on the blocking pool
/// so readers are not held up by the fsync.
///
/// Failures are logged and swallowed. Returns `(completed, total)` once the
/// record is on disk.
async fn save_store(store: &SharedStore) -> Option<(usize, usize)> {
    let snapshot = match write_store(store).snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize checkpoint");
            return None;
        }
    };
    let counts = (snapshot.completed, snapshot.total);

    match tokio::task::spawn_blocking(move || snapshot.write()).await {
        Ok(Ok(())) => Some(counts),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to save checkpoint");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Checkpoint write task failed");
            None
        }
    }
}

/// Saves the checkpoint and stops resource monitoring if a run is abandoned
/// before its final flush, e.g. when the caller drops the run future mid-drive.
struct FlushGuard {
    store: Option<SharedStore>,
    governor: Arc<ResourceGovernor>,
}

impl FlushGuard {
    fn new(store: &SharedStore, governor: &Arc<ResourceGovernor>) -> Self {
        Self {
            store: Some(Arc::clone(store)),
            governor: Arc::clone(governor),
        }
    }

    fn disarm(mut self) {
        self.store = None;
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            tracing::warn!("Run abandoned before completion, saving checkpoint");
            self.governor.halt_monitoring();
            write_store(&store).save();
        }
    }
}

/// Everything one worker task needs, cloned out of the orchestrator.
struct WorkerContext<SF, E> {
    worker_id: usize,
    factory: SF,
    extractor: E,
    retry: RetryPolicy,
    errors: ErrorTracker,
    store: SharedStore,
    queue: Arc<AsyncMutex<mpsc::Receiver<Dispatch>>>,
    results: mpsc::UnboundedSender<WorkerMessage>,
    cancel: CancellationToken,
    page_timeout: Duration,
}

impl<SF, E> WorkerContext<SF, E>
where
    SF: SessionFactory,
    E: Extractor<SF::Session>,
{
    /// Open a session, drain the queue, close the session.
    ///
    /// Returns the number of rows this worker took off the queue.
    async fn run(self) -> usize {
        let session = match self
            .retry
            .execute(
                &self.errors,
                ErrorContext::new("open_session"),
                &self.cancel,
                || self.factory.open(),
            )
            .await
        {
            Ok(session) => {
                let _ = self.results.send(WorkerMessage::SessionOpened);
                session
            }
            Err(e) => {
                tracing::error!(worker_id = self.worker_id, error = %e, "Could not open session");
                let _ = self.results.send(WorkerMessage::SessionFailed(e));
                return 0;
            }
        };

        let mut processed = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(Dispatch { index, target }) = next else {
                break;
            };
            processed += 1;

            let outcome = self.process(&session, index, &target).await;
            if self
                .results
                .send(WorkerMessage::Row {
                    index,
                    target,
                    outcome,
                })
                .is_err()
            {
                break;
            }
        }

        session.close().await;
        processed
    }

    async fn process(&self, session: &SF::Session, index: usize, target: &str) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Interrupted;
        }

        let done = read_store(&self.store).is_row_completed(index);
        if done {
            return Outcome::AlreadyCompleted;
        }

        let result = self
            .retry
            .execute(
                &self.errors,
                ErrorContext::new("extract").with_row(index, target),
                &self.cancel,
                || self.extractor.extract(session, target, self.page_timeout),
            )
            .await;

        match result {
            Ok(contacts) => Outcome::Completed(contacts),
            Err(AppError::Cancelled) => Outcome::Interrupted,
            Err(e) => Outcome::Failed(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives a row sequence through a pool of session-owning workers.
pub struct Orchestrator<SF, E> {
    factory: SF,
    extractor: E,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    governor: Arc<ResourceGovernor>,
    errors: ErrorTracker,
    reclaimer_registered: AtomicBool,
}

impl<SF, E> Orchestrator<SF, E>
where
    SF: SessionFactory,
    E: Extractor<SF::Session>,
{
    pub fn new(factory: SF, extractor: E, config: OrchestratorConfig) -> Self {
        Self {
            factory,
            extractor,
            config,
            retry: RetryPolicy::default(),
            governor: Arc::new(ResourceGovernor::new(GovernorConfig::default())),
            errors: ErrorTracker::new(),
            reclaimer_registered: AtomicBool::new(false),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_governor(mut self, governor: Arc<ResourceGovernor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_error_tracker(mut self, errors: ErrorTracker) -> Self {
        self.errors = errors;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    /// Let the governor compact this orchestrator's error history when it
    /// throttles. Registered once, on the first run that dispatches work.
    fn register_reclaimer(&self) {
        if self.reclaimer_registered.swap(true, Ordering::Relaxed) {
            return;
        }
        let errors = self.errors.clone();
        self.governor
            .register_reclaimer(Box::new(move || errors.compact()));
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    /// Process `rows` for `job_name`, resuming from its checkpoint.
    ///
    /// Returns one [`RowResult`] per input row, in input order. Cancellation
    /// is not an error: the run stops dispatching, saves, and reports the
    /// unprocessed rows as pending. Fails only when the checkpoint directory
    /// is unusable or no worker could open a session.
    pub async fn run<R: RunReporter>(
        &self,
        job_name: &str,
        mut rows: Vec<Row>,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<RunResult, AppError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();

        if let Some(limit) = self.config.test_limit
            && rows.len() > limit
        {
            tracing::info!(limit, total = rows.len(), "Test mode: truncating input");
            rows.truncate(limit);
        }

        let mut store = CheckpointStore::open(&self.config.checkpoint_dir, job_name)?;
        if self.config.fresh {
            store.reset();
        } else if self.config.retry_failed && store.is_completed() {
            tracing::info!(job = %job_name, "Re-opening completed job to retry failed rows");
            store.reopen();
        }
        store.set_total_rows(rows.len());

        let indices: Vec<usize> = (0..rows.len()).collect();
        let mut dispatch = Vec::new();

        if store.is_completed() {
            reporter.report(RunEvent::AlreadyCompleted { job: job_name });
        } else {
            for index in store.pending_rows(&indices) {
                let row = &rows[index];
                match row.validated_target() {
                    Ok(target) => dispatch.push(Dispatch { index, target }),
                    Err(e) => {
                        self.errors.log_error(
                            &e,
                            ErrorContext::new("validate_target").with_row(index, &row.target),
                        );
                        store.mark_processed(index, &row.target, Err(&e));
                        reporter.report(RunEvent::RowFailed {
                            index,
                            target: &row.target,
                            error: &e,
                        });
                    }
                }
            }
        }

        let workers = self.config.workers.max(1).min(dispatch.len());
        reporter.report(RunEvent::Started {
            job: job_name,
            total: rows.len(),
            already_completed: store.record().completed_rows.len(),
            pending: dispatch.len(),
            workers,
        });

        let store: SharedStore = Arc::new(RwLock::new(store));
        let flush_guard = FlushGuard::new(&store, &self.governor);
        let throttles_before = self.governor.stats().throttling_events;
        let to_dispatch = dispatch.len();

        let drive = if dispatch.is_empty() {
            DriveOutcome::default()
        } else {
            self.register_reclaimer();
            self.governor.start_monitoring(cancel);
            let outcome = self
                .drive(dispatch, workers, &store, cancel, reporter)
                .await;
            self.governor.stop_monitoring().await;
            outcome
        };

        // Final flush, regardless of how the pool drained.
        let unrecorded = {
            let mut store = write_store(&store);
            let unrecorded = indices
                .iter()
                .filter(|&&i| !store.is_row_completed(i) && store.failure_for(i).is_none())
                .count();
            if unrecorded == 0 && !cancel.is_cancelled() {
                store.set_completed();
            }
            unrecorded
        };
        if let Some((completed, total)) = save_store(&store).await {
            reporter.report(RunEvent::CheckpointSaved { completed, total });
        }
        flush_guard.disarm();

        let interrupted = cancel.is_cancelled() && unrecorded > 0;
        if interrupted {
            reporter.report(RunEvent::Interrupted { unrecorded });
        }

        if drive.sessions_opened == 0 && to_dispatch > 0 && !cancel.is_cancelled() {
            let reason = drive
                .session_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no worker session could be opened".to_string());
            return Err(AppError::SessionError(reason));
        }

        let store = read_store(&store);
        let results: Vec<RowResult> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                let (status, contacts) = if store.is_row_completed(index) {
                    let contacts = store
                        .completed_payload(index, row.target.trim())
                        .cloned()
                        .unwrap_or_default();
                    (RowStatus::Completed, Some(contacts))
                } else if let Some(failure) = store.failure_for(index) {
                    (
                        RowStatus::Failed {
                            kind: failure.kind.clone(),
                            message: failure.error.clone(),
                        },
                        None,
                    )
                } else {
                    (RowStatus::Pending, None)
                };
                RowResult {
                    index,
                    row,
                    contacts,
                    status,
                }
            })
            .collect();
        drop(store);

        let count = |f: fn(&RowStatus) -> bool| results.iter().filter(|r| f(&r.status)).count();
        let errors = self.errors.summary();
        let summary = RunSummary {
            run_id,
            job_name: job_name.to_string(),
            total: results.len(),
            completed: count(|s| matches!(s, RowStatus::Completed)),
            failed: count(|s| matches!(s, RowStatus::Failed { .. })),
            pending: count(|s| matches!(s, RowStatus::Pending)),
            dispatched: drive.dispatched,
            throttle_events: self
                .governor
                .stats()
                .throttling_events
                .saturating_sub(throttles_before),
            interrupted,
            elapsed: started.elapsed(),
            most_common_error: errors.most_common_error.clone(),
        };
        reporter.report(RunEvent::Finished { summary: &summary });

        Ok(RunResult {
            rows: results,
            summary,
            errors,
        })
    }

    /// Run the worker pool until the queue drains or the run is cancelled.
    async fn drive<R: RunReporter>(
        &self,
        dispatch: Vec<Dispatch>,
        workers: usize,
        store: &SharedStore,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> DriveOutcome {
        let (work_tx, work_rx) = mpsc::channel::<Dispatch>(workers);
        let queue = Arc::new(AsyncMutex::new(work_rx));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let ctx = WorkerContext {
                worker_id,
                factory: self.factory.clone(),
                extractor: self.extractor.clone(),
                retry: self.retry.clone(),
                errors: self.errors.clone(),
                store: Arc::clone(store),
                queue: Arc::clone(&queue),
                results: results_tx.clone(),
                cancel: cancel.clone(),
                page_timeout: self.config.page_timeout,
            };
            reporter.report(RunEvent::WorkerStarted { worker_id });
            pool.spawn(async move { (worker_id, ctx.run().await) });
        }
        drop(results_tx);
        drop(queue);

        let governor = &self.governor;
        let throttle_every = self.config.throttle_every;
        let throttle_pause = self.config.throttle_pause;

        let dispatcher = async move {
            let mut sent = 0;
            for item in dispatch {
                if cancel.is_cancelled() {
                    break;
                }
                if throttle_every > 0
                    && sent > 0
                    && sent % throttle_every == 0
                    && governor.throttle_if_needed(throttle_pause).await
                {
                    reporter.report(RunEvent::Throttled { dispatched: sent });
                    governor.optimize_memory(false);
                }
                tokio::select! {
                    res = work_tx.send(item) => {
                        if res.is_err() {
                            tracing::warn!("All workers exited, stopping dispatch");
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
                sent += 1;
            }
            sent
        };

        let save_every = self.config.save_every;
        let aggregator = async {
            let mut outcome = DriveOutcome::default();
            let mut since_save = 0;

            while let Some(message) = results_rx.recv().await {
                match message {
                    WorkerMessage::SessionOpened => outcome.sessions_opened += 1,
                    WorkerMessage::SessionFailed(e) => outcome.session_error = Some(e),
                    WorkerMessage::Row {
                        index,
                        target,
                        outcome: row_outcome,
                    } => match row_outcome {
                        Outcome::Completed(contacts) => {
                            write_store(store).mark_processed(index, &target, Ok(&contacts));
                            since_save += 1;
                            reporter.report(RunEvent::RowCompleted {
                                index,
                                target: &target,
                                contacts: &contacts,
                            });
                        }
                        Outcome::Failed(error) => {
                            write_store(store).mark_processed(index, &target, Err(&error));
                            since_save += 1;
                            reporter.report(RunEvent::RowFailed {
                                index,
                                target: &target,
                                error: &error,
                            });
                        }
                        Outcome::AlreadyCompleted => {
                            reporter.report(RunEvent::RowSkipped { index });
                        }
                        Outcome::Interrupted => {}
                    },
                }

                if save_every > 0 && since_save >= save_every {
                    if let Some((completed, total)) = save_store(store).await {
                        reporter.report(RunEvent::CheckpointSaved { completed, total });
                    }
                    since_save = 0;
                }
            }
            outcome
        };

        let (dispatched, mut outcome) = tokio::join!(dispatcher, aggregator);
        outcome.dispatched = dispatched;

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((worker_id, processed)) => {
                    reporter.report(RunEvent::WorkerStopped {
                        worker_id,
                        processed,
                    });
                }
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }

        outcome
    }
}

#[derive(Default)]
struct DriveOutcome {
    dispatched: usize,
    sessions_opened: usize,
    session_error: Option<AppError>,
}
