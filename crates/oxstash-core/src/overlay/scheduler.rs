//! Bounded worker pool resolving directory entries concurrently.
//!
//! Listing a directory means decrypting one dirent file per child and then
//! resolving that child's metadata. The [`MetaScheduler`] spreads this work
//! over a fixed number of tokio tasks draining one shared job queue.
//!
//! # Design
//!
//! - Fixed number of workers (`meta_workers`), started by the first listing
//! - Bounded job queue: submitters wait when it is full (back-pressure)
//! - Each request gets a fresh id and its own fan-in channel; workers reply
//!   with `(job_id, result)` on the channel carried by the job
//! - The submitter waits for exactly as many replies as it submitted jobs,
//!   bounded by a timeout
//!
//! Workers only hold the shared [`OverlayCore`], so dropping the client
//! aborts them without any reference cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::core::OverlayCore;
use crate::backend::Metadata;
use crate::error::StorageError;

/// Jobs buffered per worker before submitters have to wait.
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// One entry to resolve.
struct MetaJob {
    request_id: Uuid,
    job_id: usize,
    dirent_key: Arc<str>,
    entry_name: String,
    reply: mpsc::UnboundedSender<JobOutcome>,
}

impl std::fmt::Debug for MetaJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaJob")
            .field("request_id", &self.request_id)
            .field("job_id", &self.job_id)
            .field("entry_name", &self.entry_name)
            .finish_non_exhaustive()
    }
}

/// Result of one job, tagged with its position in the request.
///
/// `Ok(None)` means the dirent file was already gone when the job ran.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: usize,
    pub entry_name: String,
    pub result: Result<Option<Metadata>, StorageError>,
}

/// Counters describing scheduler activity.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl SchedulerStats {
    fn record_submit(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_start(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn record_complete(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if success {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Highest number of jobs that were ever resolving at the same time
    pub peak_in_flight: u64,
}

/// Fixed-size pool of metadata workers owned by one encrypted client.
pub(crate) struct MetaScheduler {
    jobs: mpsc::Sender<MetaJob>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<SchedulerStats>,
    timeout: Duration,
}

impl MetaScheduler {
    /// Spawn `worker_count` workers on the current tokio runtime.
    pub(crate) fn start(core: Arc<OverlayCore>, worker_count: usize, timeout: Duration) -> Self {
        let worker_count = worker_count.max(1);
        let (jobs, queue) = mpsc::channel(worker_count * QUEUE_DEPTH_PER_WORKER);
        let queue = Arc::new(Mutex::new(queue));
        let stats = Arc::new(SchedulerStats::default());

        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&core),
                    Arc::clone(&stats),
                ))
            })
            .collect();

        debug!(worker_count, ?timeout, "Metadata scheduler started");
        Self {
            jobs,
            workers,
            stats,
            timeout,
        }
    }

    pub(crate) fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// Resolve every entry of one dirent directory.
    ///
    /// Returns one outcome per entry, in completion order. Fails as a whole
    /// only if the pool is gone or the replies do not arrive in time.
    #[instrument(level = "debug", skip(self, entries), fields(entries = entries.len()))]
    pub(crate) async fn resolve(
        &self,
        dirent_key: &str,
        entries: Vec<String>,
    ) -> Result<Vec<JobOutcome>, StorageError> {
        let request_id = Uuid::new_v4();
        let total = entries.len();
        let dirent_key: Arc<str> = Arc::from(dirent_key);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        let fan_out = async {
            for (job_id, entry_name) in entries.into_iter().enumerate() {
                let job = MetaJob {
                    request_id,
                    job_id,
                    dirent_key: Arc::clone(&dirent_key),
                    entry_name,
                    reply: reply_tx.clone(),
                };
                self.jobs
                    .send(job)
                    .await
                    .map_err(|_| StorageError::SchedulerClosed)?;
                self.stats.record_submit();
            }
            // Only the jobs keep the fan-in open now; if a worker dies its
            // job's sender drops and the loop below ends early
            drop(reply_tx);

            let mut outcomes = Vec::with_capacity(total);
            while outcomes.len() < total {
                match reply_rx.recv().await {
                    Some(outcome) => outcomes.push(outcome),
                    None => break,
                }
            }
            Ok::<_, StorageError>(outcomes)
        };

        let outcomes = tokio::time::timeout(self.timeout, fan_out)
            .await
            .map_err(|_| StorageError::Timeout {
                operation: format!("metadata fan-out {request_id}"),
                elapsed: started.elapsed(),
            })??;

        if outcomes.len() < total {
            warn!(%request_id, received = outcomes.len(), total, "Fan-out lost replies");
            return Err(StorageError::SchedulerClosed);
        }
        trace!(%request_id, total, elapsed = ?started.elapsed(), "Fan-out complete");
        Ok(outcomes)
    }

    /// Abort all workers. Pending and future requests fail with
    /// [`StorageError::SchedulerClosed`].
    pub(crate) fn shutdown(&self) {
        for worker in &self.workers {
            worker.abort();
        }
        debug!("Metadata scheduler shut down");
    }
}

impl Drop for MetaScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<MetaJob>>>,
    core: Arc<OverlayCore>,
    stats: Arc<SchedulerStats>,
) {
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(job) = job else {
            trace!(worker_id, "Job queue closed, worker exiting");
            break;
        };

        stats.record_start();
        let result = core
            .resolve_dirent_entry(&job.dirent_key, &job.entry_name)
            .await;
        stats.record_complete(result.is_ok());

        if let Err(e) = &result {
            warn!(
                worker_id,
                request_id = %job.request_id,
                job_id = job.job_id,
                entry = %job.entry_name,
                error = %e,
                "Metadata job failed"
            );
        }

        let outcome = JobOutcome {
            job_id: job.job_id,
            entry_name: job.entry_name,
            result,
        };
        if job.reply.send(outcome).is_err() {
            trace!(worker_id, request_id = %job.request_id, "Requester gone, dropping outcome");
        }
    }
}
