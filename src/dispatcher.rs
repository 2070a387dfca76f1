//! Bounded job queue with a fixed set of worker threads.
//!
//! One dispatcher exists per decomposition level instance (the bundle, each
//! layer, each map); dispatchers are never shared between levels.
//!
//! Capacity accounting counts queued jobs plus the slots held by running
//! jobs. A running job that requeues itself through
//! [`JobContext::submit_retry`] hands its slot over to the requeued job, so
//! retries never wait and never push the queue past `max_capacity`.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::budget::{BudgetPermit, ThreadBudget};
use crate::cancel::CancelToken;
use crate::config::DispatcherConfig;
use crate::error::{BundleError, BundleResult};
use crate::pause::PauseResumeHandler;
use crate::progress::ProgressListener;

/// How long an idle worker sleeps before re-checking cancellation.
const IDLE_RECHECK: Duration = Duration::from_millis(100);

/// A unit of work executed by a dispatcher worker.
pub trait Job: Send {
    /// Execute the job. Consumes it; a job that wants another attempt moves
    /// itself back into the queue through `ctx`.
    fn run(self: Box<Self>, ctx: &mut JobContext<'_>) -> BundleResult<()>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Handle passed to a running job.
pub struct JobContext<'a> {
    shared: &'a Shared,
    requeued: bool,
}

impl JobContext<'_> {
    pub fn dispatcher_name(&self) -> &str {
        &self.shared.name
    }

    pub fn listener(&self) -> &dyn ProgressListener {
        self.shared.listener.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.shared.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Requeue a job at the tail without blocking.
    ///
    /// The running job's capacity slot moves to `job`. Fails with
    /// `Cancelled` (dropping `job`) once the dispatcher was cancelled.
    pub fn submit_retry(&mut self, job: Box<dyn Job>) -> BundleResult<()> {
        if self.requeued {
            return Err(BundleError::Validation(format!(
                "{}: a job may requeue only once per run",
                self.shared.name
            )));
        }
        let mut state = self.shared.state.lock();
        if state.rejecting || self.shared.cancel.is_cancelled() {
            return Err(BundleError::Cancelled);
        }
        state.reserved -= 1;
        state.jobs.push_back(job);
        self.requeued = true;
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }
}

/// Queue occupancy read under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    pub queued: usize,
    /// Slots held by running jobs.
    pub reserved: usize,
    pub active: usize,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub workers: usize,
}

struct QueueState {
    jobs: VecDeque<Box<dyn Job>>,
    reserved: usize,
    active: usize,
    min_capacity: usize,
    max_capacity: usize,
    /// Set by `cancel_all`: fresh submits and retries are refused.
    rejecting: bool,
    shutdown: bool,
    workers: usize,
}

impl QueueState {
    fn occupied(&self) -> usize {
        self.jobs.len() + self.reserved
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Next capacities after a backpressure episode, or `None` at the ceiling.
pub fn grown_capacity(min: usize, max: usize, ceiling: usize) -> Option<(usize, usize)> {
    if max >= ceiling {
        return None;
    }
    let new_max = max.saturating_mul(2).min(ceiling);
    let new_min = min.saturating_mul(2).min(new_max);
    Some((new_min, new_max))
}

struct Shared {
    name: Arc<str>,
    state: Mutex<QueueState>,
    available: Condvar,
    config: DispatcherConfig,
    cancel: CancelToken,
    pause: Arc<PauseResumeHandler>,
    listener: Arc<dyn ProgressListener>,
}

enum Next {
    Run(Box<dyn Job>),
    Paused,
    Exit,
}

impl Shared {
    fn next(&self) -> Next {
        let mut state = self.state.lock();
        loop {
            if self.cancel.is_cancelled() {
                state.jobs.clear();
                return Next::Exit;
            }
            if self.pause.is_paused() {
                return Next::Paused;
            }
            if let Some(job) = state.jobs.pop_front() {
                state.reserved += 1;
                state.active += 1;
                return Next::Run(job);
            }
            if state.shutdown {
                return Next::Exit;
            }
            self.available.wait_for(&mut state, IDLE_RECHECK);
        }
    }

    fn execute(&self, job: Box<dyn Job>) {
        let description = job.describe();
        let mut ctx = JobContext {
            shared: self,
            requeued: false,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run(&mut ctx)));
        let requeued = ctx.requeued;

        {
            let mut state = self.state.lock();
            state.active -= 1;
            if !requeued {
                state.reserved -= 1;
            }
        }

        match outcome {
            Ok(Ok(())) => trace!(dispatcher = %self.name, job = %description, "job done"),
            Ok(Err(BundleError::Cancelled)) => {
                debug!(dispatcher = %self.name, job = %description, "job cancelled")
            }
            Ok(Err(BundleError::ResourceExhaustion(reason))) => {
                warn!(
                    dispatcher = %self.name,
                    job = %description,
                    %reason,
                    backoff_ms = self.config.exhaustion_backoff.as_millis() as u64,
                    "resource exhaustion, backing off"
                );
                std::thread::sleep(self.config.exhaustion_backoff);
            }
            Ok(Err(e)) => warn!(dispatcher = %self.name, job = %description, error = %e, "job failed"),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(dispatcher = %self.name, job = %description, panic = %message, "job panicked");
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            match self.next() {
                Next::Run(job) => self.execute(job),
                Next::Paused => {
                    self.pause.wait_if_paused(&self.cancel);
                }
                Next::Exit => break,
            }
        }
    }
}

/// Bounded FIFO queue drained by a fixed set of worker threads.
pub struct JobDispatcher {
    shared: Arc<Shared>,
}

impl JobDispatcher {
    /// Create the dispatcher and start its workers.
    ///
    /// The first worker is always started; the remaining `thread_count - 1`
    /// are drawn from `budget` when one is given and may be fewer.
    pub fn new(
        name: &str,
        thread_count: usize,
        pause: Arc<PauseResumeHandler>,
        listener: Arc<dyn ProgressListener>,
        cancel: &CancelToken,
        budget: Option<&Arc<ThreadBudget>>,
        config: DispatcherConfig,
    ) -> BundleResult<Self> {
        let shared = Arc::new(Shared {
            name: Arc::from(name),
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                reserved: 0,
                active: 0,
                min_capacity: config.min_capacity,
                max_capacity: config.max_capacity,
                rejecting: false,
                shutdown: false,
                workers: 0,
            }),
            available: Condvar::new(),
            config,
            cancel: cancel.child(),
            pause,
            listener,
        });

        let extra = thread_count.max(1) - 1;
        let permits: Vec<Option<BudgetPermit>> = match budget {
            Some(budget) => budget.acquire_up_to(extra).into_iter().map(Some).collect(),
            None => (0..extra).map(|_| None).collect(),
        };

        let dispatcher = Self { shared };
        dispatcher.spawn_worker(0, None).map_err(|e| {
            BundleError::ResourceExhaustion(format!("cannot start worker for {}: {}", name, e))
        })?;
        for (n, permit) in permits.into_iter().enumerate() {
            if let Err(e) = dispatcher.spawn_worker(n + 1, permit) {
                warn!(dispatcher = %name, error = %e, "could not start extra worker");
                break;
            }
        }

        debug!(
            dispatcher = %name,
            workers = dispatcher.snapshot().workers,
            requested = thread_count,
            "dispatcher started"
        );
        Ok(dispatcher)
    }

    fn spawn_worker(&self, n: usize, permit: Option<BudgetPermit>) -> std::io::Result<()> {
        self.shared.state.lock().workers += 1;
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.shared.name, n))
            .spawn(move || {
                shared.worker_loop();
                drop(permit);
                shared.state.lock().workers -= 1;
                trace!(dispatcher = %shared.name, worker = n, "worker exited");
            });
        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.shared.state.lock().workers -= 1;
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a fresh job, blocking while the queue is full.
    ///
    /// Once the queue reached `max_capacity` the caller sleeps in
    /// `submit_poll` steps until occupancy drops below `min_capacity`; on
    /// that wake both capacities double, up to the ceiling.
    pub fn submit(&self, job: Box<dyn Job>) -> BundleResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let mut waited = false;
        loop {
            if state.rejecting || shared.cancel.is_cancelled() {
                return Err(BundleError::Cancelled);
            }
            if state.shutdown {
                return Err(BundleError::Shutdown(shared.name.to_string()));
            }
            let occupied = state.occupied();
            if waited {
                if occupied < state.min_capacity {
                    Self::grow(&shared.name, &mut state, shared.config.capacity_ceiling);
                    break;
                }
            } else if occupied < state.max_capacity {
                break;
            }
            if !waited {
                trace!(dispatcher = %shared.name, occupied, "queue full, waiting");
            }
            waited = true;
            MutexGuard::unlocked(&mut state, || std::thread::sleep(shared.config.submit_poll));
        }
        state.jobs.push_back(job);
        drop(state);
        shared.available.notify_one();
        Ok(())
    }

    fn grow(name: &str, state: &mut QueueState, ceiling: usize) {
        if let Some((min, max)) = grown_capacity(state.min_capacity, state.max_capacity, ceiling) {
            debug!(
                dispatcher = %name,
                min_capacity = min,
                max_capacity = max,
                "queue capacity grown"
            );
            state.min_capacity = min;
            state.max_capacity = max;
        }
    }

    /// Drop every queued job and refuse further submissions.
    /// Jobs already running are not interrupted.
    pub fn cancel_all(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.rejecting = true;
            std::mem::take(&mut state.jobs)
        };
        if !dropped.is_empty() {
            debug!(dispatcher = %self.shared.name, dropped = dropped.len(), "queue cleared");
        }
        self.shared.available.notify_all();
    }

    /// Stop accepting fresh jobs. Queued and running jobs still complete.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();
    }

    /// Cancel, clear the queue and shut down.
    pub fn abort(&self) {
        self.shared.cancel.cancel();
        self.cancel_all();
        self.shutdown();
    }

    /// Every worker has exited.
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().workers == 0
    }

    /// Shut down and sleep-poll until every worker exited.
    ///
    /// If `cancel` fires while waiting, the dispatcher is aborted and the
    /// wait continues until in-flight jobs return. Returns `false` when the
    /// dispatcher was aborted.
    pub fn await_termination(&self, poll: Duration, cancel: &CancelToken) -> bool {
        self.shutdown();
        let mut aborted = false;
        loop {
            if !aborted && cancel.is_cancelled() {
                debug!(dispatcher = %self.shared.name, "cancelled while draining, aborting");
                self.abort();
                aborted = true;
            }
            if self.is_terminated() {
                return !aborted;
            }
            std::thread::sleep(poll);
        }
    }

    /// A worker is executing a job.
    pub fn any_worker_active(&self) -> bool {
        self.shared.state.lock().active > 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let state = self.shared.state.lock();
        DispatcherSnapshot {
            queued: state.jobs.len(),
            reserved: state.reserved,
            active: state.active,
            min_capacity: state.min_capacity,
            max_capacity: state.max_capacity,
            workers: state.workers,
        }
    }
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        // Workers are detached; they finish the queue and exit on their own.
        self.shutdown();
    }
}
