//! Drift-corrected periodic scheduler.
//!
//! A job fires its callback once immediately, then at `start + k·interval`
//! for k = 1, 2, ... Each target is computed from the previous *target*, not
//! from when the callback finished, so callback latency never accumulates.
//! If a callback overruns one or more slots, those slots are skipped rather
//! than fired in a burst: the next fire is the first slot strictly after the
//! callback completed.
//!
//! Calendar components (months, years) are applied with end-of-month
//! clamping; see [`IntervalSpec::add_to`].

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use conveyor_core::{IntervalError, IntervalSpec, JobId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::queue::QueueSender;
use crate::runner::panic_message;

/// Errors returned when scheduling a job
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The interval cannot drive a schedule
    #[error("Invalid interval: {0}")]
    InvalidInterval(#[from] IntervalError),

    /// The scheduler has been shut down
    #[error("Scheduler is shut down")]
    ShutDown,
}

/// Reasons a running job stopped other than cancellation
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The callback returned an error
    #[error("Job {job} callback failed: {source}")]
    Callback {
        /// Job that failed
        job: JobId,
        /// Callback error
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    /// The next target time could not be computed
    #[error(transparent)]
    Interval(#[from] IntervalError),

    /// The callback panicked
    #[error("Job {job} panicked: {message}")]
    Panicked {
        /// Job that panicked
        job: JobId,
        /// Panic message
        message: String,
    },
}

/// Next target strictly after `now`, plus the number of slots skipped
///
/// Slots are generated from `previous` by repeated interval addition; a slot
/// equal to `now` counts as missed.
///
/// # Errors
///
/// Returns [`IntervalError`] if a slot is not representable
pub fn next_fire_time(
    interval: &IntervalSpec,
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, u64), IntervalError> {
    interval.validate()?;

    let mut next = interval.add_to(previous)?;
    let mut skipped = 0;
    while next <= now {
        next = interval.add_to(next)?;
        skipped += 1;
    }
    Ok((next, skipped))
}

/// Runs callbacks on fixed calendar intervals
///
/// Every job runs on its own tokio task. [`PeriodicScheduler::shutdown`]
/// cancels all of them.
pub struct PeriodicScheduler {
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicScheduler {
    /// Create a scheduler on the system clock
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `clock` for reading time and sleeping
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cancel every job scheduled so far and refuse new ones
    pub fn shutdown(&self) {
        info!("scheduler shutting down");
        self.shutdown.cancel();
    }

    /// True after [`PeriodicScheduler::shutdown`]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fire `callback` now and then every `interval`
    ///
    /// The job stops when cancelled, on scheduler shutdown, or when the
    /// callback returns an error. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the interval is empty or the scheduler is
    /// shut down
    pub fn schedule<F, Fut, E>(&self, callback: F, interval: IntervalSpec) -> Result<JobHandle, ScheduleError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync>> + 'static,
    {
        interval.validate()?;
        if self.is_shut_down() {
            return Err(ScheduleError::ShutDown);
        }

        let id = JobId::new();
        let cancel = self.shutdown.child_token();
        let fires = Arc::new(AtomicU64::new(0));

        let job = Job {
            id,
            interval,
            clock: Arc::clone(&self.clock),
            fires: Arc::clone(&fires),
        };
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    info!(job = %id, "job cancelled");
                    Ok(())
                }
                result = job.drive(callback) => result,
            }
        });

        info!(job = %id, interval = %interval, "job scheduled");
        Ok(JobHandle {
            id,
            interval,
            cancel,
            fires,
            task,
        })
    }

    /// Enqueue a clone of `task` now and then every `interval`
    ///
    /// The job ends with [`JobError::Callback`] once the queue has no
    /// consumers left.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the interval is empty or the scheduler is
    /// shut down
    pub fn schedule_enqueue<T>(
        &self,
        interval: IntervalSpec,
        sender: QueueSender<T>,
        task: T,
    ) -> Result<JobHandle, ScheduleError>
    where
        T: Clone + Send + 'static,
    {
        self.schedule(
            move || {
                let sender = sender.clone();
                let task = task.clone();
                async move { sender.send(task).await.map_err(|_| "task queue closed") }
            },
            interval,
        )
    }
}

struct Job {
    id: JobId,
    interval: IntervalSpec,
    clock: Arc<dyn Clock>,
    fires: Arc<AtomicU64>,
}

impl Job {
    async fn drive<F, Fut, E>(self, mut callback: F) -> Result<(), JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let mut previous = self.clock.now();
        loop {
            self.fires.fetch_add(1, Ordering::Relaxed);
            debug!(job = %self.id, target = %previous, "firing");
            if let Err(err) = callback().await {
                let err = JobError::Callback {
                    job: self.id,
                    source: err.into(),
                };
                error!(error = %err, "job stopping");
                return Err(err);
            }

            let now = self.clock.now();
            let (next, skipped) = next_fire_time(&self.interval, previous, now)?;
            if skipped > 0 {
                warn!(job = %self.id, skipped, next = %next, "callback overran its interval, skipping missed slots");
            }

            self.clock.sleep_until(next).await;
            previous = next;
        }
    }
}

/// Handle to a scheduled job
pub struct JobHandle {
    id: JobId,
    interval: IntervalSpec,
    cancel: CancellationToken,
    fires: Arc<AtomicU64>,
    task: JoinHandle<Result<(), JobError>>,
}

impl JobHandle {
    /// Job ID
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Interval this job repeats on
    #[must_use]
    pub const fn interval(&self) -> IntervalSpec {
        self.interval
    }

    /// Number of times the callback has been started
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::Relaxed)
    }

    /// Stop the job; an in-progress callback is dropped at its next await
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the job has stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to stop
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the job stopped for a reason other than
    /// cancellation
    pub async fn join(self) -> Result<(), JobError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(JobError::Panicked {
                job: self.id,
                message: panic_message(err.into_panic().as_ref()),
            }),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("fires", &self.fire_count())
            .finish()
    }
}
