//! Bounded-concurrency transfer pool.
//!
//! A fixed number of workers pull [`FileSpec`]s from a shared queue and move
//! them with the store's `transfer`. A single coordinator owns every
//! [`TransferTask`]: it reads worker reports, decides between success, retry
//! and failure, and parks retries in a timer queue until their backoff
//! elapses. One task exhausting its attempts never stops the batch.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use nwp_common::{NwpError, NwpResult};
use storage::ObjectStoreHandle;

use crate::files::FileSpec;

/// Configuration for one batch.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers
    pub concurrency: usize,
    /// Maximum attempts per task, including the first
    pub max_retries: u32,
    /// Delay before the first retry (doubles each retry)
    pub retry_backoff: Duration,
    /// Upper bound on any single retry delay
    pub max_backoff: Duration,
    /// Limit on one transfer attempt
    pub item_timeout: Duration,
    /// Succeed without transferring when the destination already exists
    pub skip_existing: bool,
    /// Re-probe every succeeded destination once the batch is done
    pub verify_after: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            item_timeout: Duration::from_secs(600), // 10 minutes
            skip_existing: false,
            verify_after: true,
        }
    }
}

impl PoolConfig {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Lifecycle of a task within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    RetryPending,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// One file moving through the pool.
#[derive(Debug, Clone)]
pub struct TransferTask {
    spec: FileSpec,
    attempt_count: u32,
    last_error: Option<NwpError>,
    state: TaskState,
    bytes: u64,
    skipped: bool,
}

impl TransferTask {
    pub fn new(spec: FileSpec) -> Self {
        Self {
            spec,
            attempt_count: 0,
            last_error: None,
            state: TaskState::Pending,
            bytes: 0,
            skipped: false,
        }
    }

    pub fn spec(&self) -> &FileSpec {
        &self.spec
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&NwpError> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    fn begin_attempt(&mut self) {
        debug_assert!(matches!(
            self.state,
            TaskState::Pending | TaskState::RetryPending
        ));
        self.attempt_count += 1;
        self.state = TaskState::InFlight;
    }

    fn succeed(&mut self, bytes: u64, skipped: bool) {
        self.bytes = bytes;
        self.skipped = skipped;
        self.state = TaskState::Succeeded;
    }

    /// Record a failed attempt and move to `RetryPending` or `Failed`.
    fn fail(&mut self, error: NwpError, max_attempts: u32, may_retry: bool) -> TaskState {
        let retry = may_retry && error.is_retryable() && self.attempt_count < max_attempts;
        self.last_error = Some(error);
        self.state = if retry {
            TaskState::RetryPending
        } else {
            TaskState::Failed
        };
        self.state
    }

    /// Fail with `Cancelled`. A task still `InFlight` here was queued but
    /// never picked up, so its attempt is not counted.
    fn abandon(&mut self) {
        if self.state == TaskState::InFlight {
            self.attempt_count = self.attempt_count.saturating_sub(1);
        }
        self.last_error = Some(NwpError::Cancelled);
        self.state = TaskState::Failed;
    }

    fn into_outcome(self) -> Result<CompletedTransfer, FailedTransfer> {
        match self.state {
            TaskState::Succeeded => Ok(CompletedTransfer {
                spec: self.spec,
                attempts: self.attempt_count,
                bytes: self.bytes,
                skipped: self.skipped,
            }),
            _ => Err(FailedTransfer {
                spec: self.spec,
                attempts: self.attempt_count,
                error: self.last_error.unwrap_or(NwpError::Cancelled),
            }),
        }
    }
}

/// A task that ended in success.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTransfer {
    pub spec: FileSpec,
    pub attempts: u32,
    pub bytes: u64,
    /// Destination already existed; nothing was transferred
    pub skipped: bool,
}

/// A task that ended in failure, with its last error.
#[derive(Debug, Clone)]
pub struct FailedTransfer {
    pub spec: FileSpec,
    pub attempts: u32,
    pub error: NwpError,
}

/// Every task of a batch, split by outcome.
///
/// Transfer outcomes keep input order; verification failures follow them.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub succeeded: Vec<CompletedTransfer>,
    pub failed: Vec<FailedTransfer>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.succeeded.iter().map(|c| c.bytes).sum()
    }

    pub fn skipped(&self) -> usize {
        self.succeeded.iter().filter(|c| c.skipped).count()
    }

    /// Escalate any failure to `TransferFailed`.
    pub fn into_result(self) -> NwpResult<Vec<CompletedTransfer>> {
        match self.failed.first() {
            None => Ok(self.succeeded),
            Some(first) => Err(NwpError::TransferFailed {
                failed: self.failed.len(),
                total: self.succeeded.len() + self.failed.len(),
                first_error: format!("{}: {}", first.spec.source(), first.error),
            }),
        }
    }
}

/// Progress notifications, delivered as tasks resolve.
#[derive(Debug)]
pub enum TransferEvent<'a> {
    Succeeded(&'a CompletedTransfer),
    Retrying {
        spec: &'a FileSpec,
        attempt: u32,
        delay: Duration,
        error: &'a NwpError,
    },
    Failed(&'a FailedTransfer),
}

/// Receives [`TransferEvent`]s from the coordinator.
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent<'_>);
}

struct Job {
    id: usize,
    spec: FileSpec,
}

enum Attempt {
    Transferred(u64),
    Skipped,
}

struct Report {
    id: usize,
    result: NwpResult<Attempt>,
}

/// Runs batches of transfers against one store.
pub struct TransferWorkerPool {
    store: Arc<dyn ObjectStoreHandle>,
    config: PoolConfig,
    label: String,
    observer: Option<Arc<dyn TransferObserver>>,
}

impl TransferWorkerPool {
    pub fn new(store: Arc<dyn ObjectStoreHandle>, config: PoolConfig) -> Self {
        Self {
            store,
            config,
            label: "transfer".to_string(),
            observer: None,
        }
    }

    /// Name used in logs and as the `direction` metrics label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Transfer every spec and report per-item outcomes.
    ///
    /// Never returns an error: failures are collected in
    /// [`BatchResult::failed`]. When `cancel` fires, workers stop taking new
    /// tasks and everything not yet finished is failed with `Cancelled`.
    #[instrument(
        skip_all,
        fields(
            batch_id = tracing::field::Empty,
            label = %self.label,
            tasks = specs.len(),
            concurrency = self.config.concurrency
        )
    )]
    pub async fn run_batch(&self, specs: Vec<FileSpec>, cancel: &CancellationToken) -> BatchResult {
        if specs.is_empty() {
            return BatchResult::default();
        }
        tracing::Span::current().record("batch_id", tracing::field::display(Uuid::new_v4()));

        let mut tasks: Vec<TransferTask> = specs.into_iter().map(TransferTask::new).collect();
        let workers = self.config.concurrency.clamp(1, tasks.len());
        info!(workers, "Starting transfer batch");

        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Report>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            pool.spawn(worker(
                worker_id,
                self.store.clone(),
                self.config.clone(),
                self.label.clone(),
                job_rx.clone(),
                report_tx.clone(),
                cancel.clone(),
            ));
        }
        // Workers hold the only senders, so the report channel closes once they exit.
        drop(report_tx);

        for (id, task) in tasks.iter_mut().enumerate() {
            dispatch(&job_tx, id, task);
        }

        let mut retries: DelayQueue<usize> = DelayQueue::new();
        let mut outstanding = tasks.len();
        let mut cancelled = false;

        while outstanding > 0 {
            tokio::select! {
                report = report_rx.recv() => {
                    let Some(report) = report else { break };
                    let task = &mut tasks[report.id];
                    match report.result {
                        Ok(attempt) => {
                            self.record_success(task, attempt);
                            outstanding -= 1;
                        }
                        Err(e) => {
                            match task.fail(e, self.config.max_retries, !cancelled) {
                                TaskState::RetryPending => {
                                    let delay = self.config.backoff_for(task.attempt_count);
                                    self.record_retry(task, delay);
                                    retries.insert(report.id, delay);
                                }
                                _ => {
                                    self.record_failure(task);
                                    outstanding -= 1;
                                }
                            }
                        }
                    }
                }
                Some(expired) = retries.next(), if !retries.is_empty() => {
                    let id = expired.into_inner();
                    dispatch(&job_tx, id, &mut tasks[id]);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!(outstanding, "Transfer batch cancelled");
                    retries.clear();
                    for task in tasks.iter_mut().filter(|t| t.state == TaskState::RetryPending) {
                        task.abandon();
                        self.record_failure(task);
                        outstanding -= 1;
                    }
                }
            }
        }

        drop(job_tx);
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Transfer worker panicked");
            }
        }

        // Dispatched but never picked up before cancellation
        for task in tasks.iter_mut().filter(|t| !t.state.is_terminal()) {
            task.abandon();
            self.record_failure(task);
        }

        let mut result = BatchResult::default();
        for task in tasks {
            match task.into_outcome() {
                Ok(done) => result.succeeded.push(done),
                Err(failed) => result.failed.push(failed),
            }
        }

        if self.config.verify_after && !cancelled {
            self.verify(&mut result).await;
        }

        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped(),
            bytes = result.bytes_transferred(),
            "Transfer batch complete"
        );

        result
    }

    /// Re-probe succeeded destinations and fail any that are missing.
    async fn verify(&self, result: &mut BatchResult) {
        let store = &self.store;
        let present: Vec<bool> = stream::iter(&result.succeeded)
            .map(|done| async move {
                match store.exists(done.spec.destination()).await {
                    Ok(present) => present,
                    Err(e) => {
                        warn!(destination = %done.spec.destination(), error = %e, "Verification probe failed");
                        false
                    }
                }
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let (kept, lost): (Vec<_>, Vec<_>) = std::mem::take(&mut result.succeeded)
            .into_iter()
            .zip(present)
            .partition(|(_, present)| *present);

        result.succeeded = kept.into_iter().map(|(done, _)| done).collect();
        for (done, _) in lost {
            let failed = FailedTransfer {
                error: NwpError::PostTransferVerificationFailed(done.spec.destination().to_string()),
                spec: done.spec,
                attempts: done.attempts,
            };
            self.record_lost(&failed);
            result.failed.push(failed);
        }
        debug!(verified = result.succeeded.len(), "Verified destinations");
    }

    fn record_success(&self, task: &mut TransferTask, attempt: Attempt) {
        let (bytes, skipped) = match attempt {
            Attempt::Transferred(bytes) => (bytes, false),
            Attempt::Skipped => (0, true),
        };
        task.succeed(bytes, skipped);

        counter!("nwp_transfer_succeeded_total", "direction" => self.label.clone()).increment(1);
        counter!("nwp_transfer_bytes_total", "direction" => self.label.clone()).increment(bytes);
        debug!(
            destination = %task.spec.destination(),
            attempts = task.attempt_count,
            bytes,
            skipped,
            "Transfer succeeded"
        );

        if let Some(observer) = &self.observer {
            if let Ok(done) = task.clone().into_outcome() {
                observer.on_event(&TransferEvent::Succeeded(&done));
            }
        }
    }

    fn record_retry(&self, task: &TransferTask, delay: Duration) {
        let Some(error) = task.last_error.as_ref() else {
            return;
        };
        warn!(
            source = %task.spec.source(),
            error = %error,
            attempt = task.attempt_count,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Transfer failed, retrying"
        );
        if let Some(observer) = &self.observer {
            observer.on_event(&TransferEvent::Retrying {
                spec: &task.spec,
                attempt: task.attempt_count,
                delay,
                error,
            });
        }
    }

    fn record_failure(&self, task: &TransferTask) {
        counter!("nwp_transfer_failed_total", "direction" => self.label.clone()).increment(1);
        if let Err(failed) = task.clone().into_outcome() {
            error!(
                source = %failed.spec.source(),
                attempts = failed.attempts,
                error = %failed.error,
                "Transfer failed"
            );
            if let Some(observer) = &self.observer {
                observer.on_event(&TransferEvent::Failed(&failed));
            }
        }
    }

    fn record_lost(&self, failed: &FailedTransfer) {
        counter!("nwp_transfer_failed_total", "direction" => self.label.clone()).increment(1);
        error!(destination = %failed.spec.destination(), "Transferred file missing at destination");
        if let Some(observer) = &self.observer {
            observer.on_event(&TransferEvent::Failed(failed));
        }
    }
}

fn dispatch(jobs: &mpsc::UnboundedSender<Job>, id: usize, task: &mut TransferTask) {
    task.begin_attempt();
    // Workers only go away once the channel is closed or the batch is
    // cancelled; an unsent job is abandoned at the end of the batch.
    let _ = jobs.send(Job {
        id,
        spec: task.spec.clone(),
    });
}

async fn worker(
    worker_id: usize,
    store: Arc<dyn ObjectStoreHandle>,
    config: PoolConfig,
    label: String,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    reports: mpsc::UnboundedSender<Report>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = jobs.recv() => job,
            }
        };
        let Some(job) = job else { break };

        counter!("nwp_transfer_attempts_total", "direction" => label.clone()).increment(1);
        let result = match tokio::time::timeout(config.item_timeout, attempt(&*store, &config, &job.spec)).await {
            Ok(result) => result,
            Err(_) => Err(NwpError::Timeout(config.item_timeout.as_secs())),
        };

        if reports.send(Report { id: job.id, result }).is_err() {
            break;
        }
    }
    debug!(worker_id, "Transfer worker stopped");
}

async fn attempt(store: &dyn ObjectStoreHandle, config: &PoolConfig, spec: &FileSpec) -> NwpResult<Attempt> {
    if config.skip_existing {
        match store.exists(spec.destination()).await {
            Ok(true) => return Ok(Attempt::Skipped),
            Ok(false) => {}
            Err(e) => debug!(destination = %spec.destination(), error = %e, "Destination probe failed"),
        }
    }
    let bytes = store.transfer(spec.source(), spec.destination()).await?;
    Ok(Attempt::Transferred(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{archive_locator, mirror_locator};

    fn task() -> TransferTask {
        TransferTask::new(FileSpec::for_offset(0, archive_locator(0), mirror_locator(0), true))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PoolConfig {
            retry_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for(3), Duration::from_secs(8));
        assert_eq!(config.backoff_for(4), Duration::from_secs(10));
        assert_eq!(config.backoff_for(60), Duration::from_secs(10));
    }

    #[test]
    fn test_task_retries_until_attempt_cap() {
        let mut t = task();
        for expected in [TaskState::RetryPending, TaskState::RetryPending, TaskState::Failed] {
            t.begin_attempt();
            assert_eq!(t.state(), TaskState::InFlight);
            let state = t.fail(NwpError::StorageError("reset".into()), 3, true);
            assert_eq!(state, expected);
        }
        assert_eq!(t.attempt_count(), 3);
        assert!(matches!(t.last_error(), Some(NwpError::StorageError(_))));
    }

    #[test]
    fn test_task_permanent_error_fails_at_once() {
        let mut t = task();
        t.begin_attempt();
        assert_eq!(t.fail(NwpError::NotFound("x".into()), 3, true), TaskState::Failed);
        assert_eq!(t.attempt_count(), 1);
    }

    #[test]
    fn test_task_no_retry_once_cancelled() {
        let mut t = task();
        t.begin_attempt();
        assert_eq!(t.fail(NwpError::Timeout(5), 3, false), TaskState::Failed);
    }

    #[test]
    fn test_into_result_reports_counts() {
        let mut ok = task();
        ok.begin_attempt();
        ok.succeed(10, false);

        let mut bad = task();
        bad.begin_attempt();
        bad.fail(NwpError::NotFound("gone".into()), 3, true);

        let batch = BatchResult {
            succeeded: vec![ok.into_outcome().unwrap()],
            failed: vec![bad.into_outcome().unwrap_err()],
        };

        match batch.into_result() {
            Err(NwpError::TransferFailed { failed, total, first_error }) => {
                assert_eq!((failed, total), (1, 2));
                assert!(first_error.contains("gone"));
            }
            other => panic!("expected TransferFailed, got {:?}", other),
        }
    }
}
