//! Handles for running stage pools.

use std::fmt;
use std::sync::Arc;

use conveyor_core::RunnerId;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::monitor::{MetricsSnapshot, PipelineMetrics, RunnerMetrics};
use crate::queue::QueueProbe;
use crate::runner::{RunnerError, StageRunner, panic_message};

/// Which pool a runner belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageGroup {
    /// First-stage runners reading the external source
    Processor,
    /// Second-stage runners reading the intermediate queue
    OutputHandler,
}

impl fmt::Display for StageGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processor => write!(f, "processor"),
            Self::OutputHandler => write!(f, "output_handler"),
        }
    }
}

/// A spawned [`StageRunner`]
pub struct RunnerHandle {
    id: RunnerId,
    stage: String,
    group: StageGroup,
    metrics: Arc<RunnerMetrics>,
    task: JoinHandle<Result<(), RunnerError>>,
}

impl RunnerHandle {
    /// Spawn `runner` onto the current tokio runtime
    pub fn spawn<T, R>(runner: StageRunner<T, R>, group: StageGroup) -> Self
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let id = runner.id();
        let stage = runner.stage_name().to_string();
        let metrics = runner.metrics();
        let task = tokio::spawn(runner.run());
        Self {
            id,
            stage,
            group,
            metrics,
            task,
        }
    }

    /// Runner ID
    #[must_use]
    pub const fn id(&self) -> RunnerId {
        self.id
    }

    /// Stage name
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Pool this runner belongs to
    #[must_use]
    pub const fn group(&self) -> StageGroup {
        self.group
    }

    /// Live counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the runner at its next suspension point
    pub fn abort(&self) {
        self.task.abort();
    }

    /// True once the runner has returned or been aborted
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the runner to finish
    pub async fn join(self) -> RunnerReport {
        let outcome = match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(RunnerError::Aborted { runner: self.id }),
            Err(err) => Err(RunnerError::Panicked {
                runner: self.id,
                message: panic_message(err.into_panic().as_ref()),
            }),
        };
        RunnerReport {
            id: self.id,
            stage: self.stage,
            group: self.group,
            metrics: self.metrics.snapshot(),
            outcome,
        }
    }
}

impl fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("group", &self.group)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Final state of one runner
#[derive(Debug)]
pub struct RunnerReport {
    /// Runner ID
    pub id: RunnerId,
    /// Stage name
    pub stage: String,
    /// Pool the runner belonged to
    pub group: StageGroup,
    /// Counters at exit
    pub metrics: MetricsSnapshot,
    /// How the runner ended
    pub outcome: Result<(), RunnerError>,
}

impl RunnerReport {
    /// True if the runner stopped on end-of-stream
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Handle to a composed pipeline
///
/// Dropping the handle detaches the runners; they keep going until their
/// sources end. Use [`Pipeline::abort`] to stop them.
#[derive(Debug)]
pub struct Pipeline {
    runners: Vec<RunnerHandle>,
    queue: Option<QueueProbe>,
}

impl Pipeline {
    pub(crate) fn new(runners: Vec<RunnerHandle>, queue: Option<QueueProbe>) -> Self {
        Self { runners, queue }
    }

    /// Running and finished runners, processors first
    #[must_use]
    pub fn runners(&self) -> &[RunnerHandle] {
        &self.runners
    }

    /// Number of runners
    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// True if no runners were started
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Intermediate queue, present only when output handlers were given
    #[must_use]
    pub fn queue(&self) -> Option<&QueueProbe> {
        self.queue.as_ref()
    }

    /// Abort every runner
    ///
    /// Tasks already fetched and not yet acknowledged are abandoned.
    pub fn abort(&self) {
        for runner in &self.runners {
            runner.abort();
        }
    }

    /// True once every runner has finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.runners.iter().all(RunnerHandle::is_finished)
    }

    /// Aggregated live counters
    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        let mut metrics = PipelineMetrics {
            queue_depth: self.queue.as_ref().map(QueueProbe::depth),
            queue_fill: self.queue.as_ref().map(QueueProbe::fill_ratio),
            ..PipelineMetrics::default()
        };
        for runner in &self.runners {
            let snapshot = runner.metrics();
            match runner.group() {
                StageGroup::Processor => metrics.processors.merge(&snapshot),
                StageGroup::OutputHandler => metrics.output_handlers.merge(&snapshot),
            }
        }
        metrics
    }

    /// Wait for every runner, in start order
    pub async fn join(self) -> Vec<RunnerReport> {
        let mut reports = Vec::with_capacity(self.runners.len());
        for runner in self.runners {
            let report = runner.join().await;
            if let Err(err) = &report.outcome {
                warn!(runner = %report.id, group = %report.group, error = %err, "runner ended with error");
            }
            reports.push(report);
        }
        reports
    }
}
