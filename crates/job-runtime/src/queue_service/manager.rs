//! Worker side of the queue-service backend: weighted fetch loops, dispatch
//! by job type, and the heartbeat.

use crate::config::{weight_for, QueueServiceWorkerConfig};
use crate::error::ProcessingError;
use crate::helper::Helper;
use crate::lifecycle::WorkerContext;
use crate::processor::{ProcessorBindings, SharedProcessor};
use crate::queue_service::helper::QueueServiceHelper;
use crate::queue_service::pool::ConnectionPool;
use crate::queue_service::transport::{HeartbeatState, JobFailure, ServiceJob};
use crate::retry::Backoff;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;

/// Failure type reported when no processor handles the job type
pub const UNKNOWN_JOB_TYPE: &str = "UnknownJobType";

/// Failure type reported when a processor panics
pub const PANIC_ERROR_TYPE: &str = "panic";

/// Failure type reported when a processor returns an error
pub const PROCESSING_ERROR_TYPE: &str = "ProcessingError";

// ============================================================================
// Weighted Queues
// ============================================================================

/// Queue names with their fetch weights
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightedQueues {
    weights: BTreeMap<String, usize>,
}

impl WeightedQueues {
    /// Build from a priority map; non-positive weights count as 1
    pub fn from_priorities(priorities: &HashMap<String, i64>) -> Self {
        Self {
            weights: priorities
                .keys()
                .map(|name| (name.clone(), weight_for(priorities, name)))
                .collect(),
        }
    }

    /// Add `queue` with weight 1 unless it already has a weight
    pub fn ensure(&mut self, queue: &str) {
        self.weights.entry(queue.to_string()).or_insert(1);
    }

    pub fn weight(&self, queue: &str) -> Option<usize> {
        self.weights.get(queue).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Queue order for one fetch.
    ///
    /// Each queue appears `weight` times before shuffling and only its first
    /// occurrence is kept, so heavier queues tend to come first.
    pub fn fetch_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        let mut expanded: Vec<&str> = self
            .weights
            .iter()
            .flat_map(|(name, weight)| std::iter::repeat(name.as_str()).take(*weight))
            .collect();
        expanded.shuffle(rng);

        let mut seen = HashSet::with_capacity(self.weights.len());
        expanded
            .into_iter()
            .filter(|name| seen.insert(*name))
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Worker Manager
// ============================================================================

/// Runs `concurrency` fetch loops and one heartbeat loop over a worker pool
pub struct WorkerManager {
    worker_id: String,
    pool: Arc<ConnectionPool>,
    sender: Arc<ConnectionPool>,
    processors: HashMap<String, SharedProcessor>,
    queues: WeightedQueues,
    concurrency: usize,
    heartbeat_interval: Duration,
    quiet: AtomicBool,
    backoff: Backoff,
}

impl WorkerManager {
    /// Build the dispatch table from bindings keyed (queue, job type).
    ///
    /// Every bound queue is fetched; queues missing from the priority map
    /// get weight 1.
    pub fn new(
        worker_id: String,
        config: &QueueServiceWorkerConfig,
        pool: Arc<ConnectionPool>,
        sender: Arc<ConnectionPool>,
        bindings: &ProcessorBindings,
    ) -> Self {
        let mut queues = WeightedQueues::from_priorities(&config.priorities);
        let mut processors = HashMap::new();
        for binding in bindings.bindings() {
            queues.ensure(&binding.topic);
            if processors
                .insert(binding.channel.clone(), binding.processor)
                .is_some()
            {
                warn!(
                    job_type = %binding.channel,
                    queue = %binding.topic,
                    "Job type bound on several queues; last binding wins"
                );
            }
        }

        Self {
            worker_id,
            pool,
            sender,
            processors,
            queues,
            concurrency: config.concurrency.max(1),
            heartbeat_interval: config.heartbeat_interval(),
            quiet: AtomicBool::new(false),
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(10)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queues(&self) -> &WeightedQueues {
        &self.queues
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// True once the server asked this worker to stop taking jobs
    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Acquire)
    }

    /// Spawn the heartbeat and fetch loops on `ctx`
    pub fn spawn(self: &Arc<Self>, ctx: &WorkerContext) {
        info!(
            wid = %self.worker_id,
            concurrency = self.concurrency,
            queues = ?self.queues.names().collect::<Vec<_>>(),
            "Starting queue-service workers"
        );

        ctx.spawn(Arc::clone(self).heartbeat_loop(ctx.clone()));
        for index in 0..self.concurrency {
            ctx.spawn(Arc::clone(self).fetch_loop(ctx.clone(), index));
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, ctx: WorkerContext) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = match self.pool.get().await {
                Ok(mut connection) => {
                    let result = connection.beat().await;
                    connection.check(&result);
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(HeartbeatState::Running) => debug!(wid = %self.worker_id, "Heartbeat"),
                Ok(HeartbeatState::Quiet) => {
                    if !self.quiet.swap(true, Ordering::AcqRel) {
                        info!(wid = %self.worker_id, "Server requested quiet, no longer fetching jobs");
                    }
                }
                Ok(HeartbeatState::Terminate) => {
                    self.quiet.store(true, Ordering::Release);
                    warn!(wid = %self.worker_id, "Server requested terminate, shutting down workers");
                    ctx.token().cancel();
                    break;
                }
                Err(e) => warn!(wid = %self.worker_id, error = %e, "Heartbeat failed"),
            }
        }
        debug!(wid = %self.worker_id, "Heartbeat loop exited");
    }

    async fn fetch_loop(self: Arc<Self>, ctx: WorkerContext, index: usize) {
        let mut failures: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                break;
            }
            if self.is_quiet() {
                ctx.cancelled().await;
                break;
            }

            let order = self.queues.fetch_order(&mut rand::thread_rng());
            let fetched = match self.pool.get().await {
                Ok(mut connection) => {
                    let outcome = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => None,
                        result = connection.fetch(&order) => Some(result),
                    };
                    match outcome {
                        Some(result) => {
                            connection.check(&result);
                            result
                        }
                        None => {
                            // Fetch abandoned mid-reply; the connection state is unknown
                            connection.mark_broken();
                            break;
                        }
                    }
                }
                Err(e) => Err(e),
            };

            match fetched {
                Ok(Some(job)) => {
                    failures = 0;
                    self.perform(job).await;
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        fetcher = index,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Fetch failed"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(fetcher = index, "Fetch loop exited");
    }

    /// Run one job and report ACK or FAIL
    pub async fn perform(&self, job: ServiceJob) {
        let jid = job.jid.clone();
        let outcome = self.invoke(job).await;

        let result = match self.pool.get().await {
            Ok(mut connection) => {
                let result = match &outcome {
                    Ok(()) => connection.ack(&jid).await,
                    Err(failure) => connection.fail(failure).await,
                };
                connection.check(&result);
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(
                jid = %jid,
                succeeded = outcome.is_ok(),
                error = %e,
                "Failed to report job outcome"
            );
        }
    }

    async fn invoke(&self, job: ServiceJob) -> Result<(), JobFailure> {
        let Some(processor) = self.processors.get(&job.jobtype).cloned() else {
            warn!(jid = %job.jid, job_type = %job.jobtype, "No processor for job type");
            return Err(JobFailure {
                jid: job.jid.clone(),
                errtype: UNKNOWN_JOB_TYPE.to_string(),
                message: format!("No processor registered for job type {}", job.jobtype),
                backtrace: Vec::new(),
            });
        };

        info!("Working on job {}", job.jid);
        let span = info_span!(
            "job",
            jid = %job.jid,
            job_type = %job.jobtype,
            queue = %job.queue,
        );
        let helper: Arc<dyn Helper> = Arc::new(QueueServiceHelper::new(&job, Arc::clone(&self.sender)));
        let args = job.args.clone();

        let invocation =
            tokio::spawn(async move { processor.process(helper, args).await }.instrument(span));
        match invocation.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(jid = %job.jid, job_type = %job.jobtype, error = %e, "Job failed");
                Err(processing_failure(&job.jid, &e))
            }
            Err(join) => {
                error!(jid = %job.jid, job_type = %job.jobtype, "Processor panicked");
                Err(panic_failure(&job.jid, join))
            }
        }
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("worker_id", &self.worker_id)
            .field("queues", &self.queues)
            .field("job_types", &self.processors.keys().collect::<Vec<_>>())
            .field("concurrency", &self.concurrency)
            .field("quiet", &self.is_quiet())
            .finish()
    }
}

fn processing_failure(jid: &str, error: &ProcessingError) -> JobFailure {
    JobFailure {
        jid: jid.to_string(),
        errtype: PROCESSING_ERROR_TYPE.to_string(),
        message: error.to_string(),
        backtrace: error.chain().skip(1).map(ToString::to_string).collect(),
    }
}

fn panic_failure(jid: &str, join: JoinError) -> JobFailure {
    let message = if join.is_panic() {
        let payload = join.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "processor panicked".to_string())
    } else {
        join.to_string()
    };

    JobFailure {
        jid: jid.to_string(),
        errtype: PANIC_ERROR_TYPE.to_string(),
        message,
        backtrace: Vec::new(),
    }
}
