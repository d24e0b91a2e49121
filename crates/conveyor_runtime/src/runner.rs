//! Stage runner: the consumer loop binding one source to one stage.
//!
//! Per iteration the runner fetches a task, processes it, forwards a
//! non-empty result to the output queue (if any) and then acknowledges the
//! fetch. Acknowledgement is tied to the fetch, not to processing success, so
//! delivery is at-most-once and nothing is redelivered.
//!
//! End-of-stream is the only intended way for a runner to stop. A failing or
//! panicking stage is handled according to the runner's [`FailurePolicy`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use conveyor_core::{CoreError, RunnerId};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::monitor::RunnerMetrics;
use crate::queue::QueueSender;
use crate::source::{Fetched, SourceError, TaskSource};
use crate::stage::{StageError, WorkStage};

/// What a runner does when `process` fails or panics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure, acknowledge the task and keep consuming
    #[default]
    Isolate,
    /// Acknowledge the task, then stop this runner with the error.
    ///
    /// Sibling runners keep going, so the stage silently stops consuming
    /// from the caller's point of view unless the runner's handle is joined.
    Halt,
}

impl FromStr for FailurePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "halt" => Ok(Self::Halt),
            other => Err(CoreError::validation(
                "failure_policy",
                format!("expected 'isolate' or 'halt', got '{}'", other),
            )),
        }
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The source failed with something other than end-of-stream
    #[error("Source failed: {0}")]
    Source(#[from] SourceError),

    /// The stage failed under [`FailurePolicy::Halt`]
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        /// Stage name
        stage: String,
        /// Underlying failure
        #[source]
        source: StageError,
    },

    /// The downstream queue has no consumers left
    #[error("Output queue closed, result from stage '{stage}' dropped")]
    OutputClosed {
        /// Stage name
        stage: String,
    },

    /// The runner task was aborted before it finished
    #[error("Runner {runner} was aborted")]
    Aborted {
        /// Runner that was aborted
        runner: RunnerId,
    },

    /// The runner task panicked outside the per-task boundary
    #[error("Runner {runner} panicked: {message}")]
    Panicked {
        /// Runner that panicked
        runner: RunnerId,
        /// Panic message
        message: String,
    },
}

/// Drives one [`TaskSource`] against one [`WorkStage`]
pub struct StageRunner<T, R> {
    id: RunnerId,
    source: Arc<dyn TaskSource<T>>,
    stage: Box<dyn WorkStage<T, Output = R>>,
    output: Option<QueueSender<R>>,
    policy: FailurePolicy,
    metrics: Arc<RunnerMetrics>,
}

impl<T: Send + 'static, R: Send + 'static> StageRunner<T, R> {
    /// Create a runner with no output queue and [`FailurePolicy::Isolate`]
    pub fn new(source: Arc<dyn TaskSource<T>>, stage: Box<dyn WorkStage<T, Output = R>>) -> Self {
        Self {
            id: RunnerId::new(),
            source,
            stage,
            output: None,
            policy: FailurePolicy::default(),
            metrics: Arc::new(RunnerMetrics::new()),
        }
    }

    /// Forward non-empty results into `output`
    #[must_use]
    pub fn with_output(mut self, output: QueueSender<R>) -> Self {
        self.output = Some(output);
        self
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runner ID
    #[must_use]
    pub const fn id(&self) -> RunnerId {
        self.id
    }

    /// Name of the bound stage
    #[must_use]
    pub fn stage_name(&self) -> &str {
        self.stage.name()
    }

    /// Shared handle to this runner's counters
    #[must_use]
    pub fn metrics(&self) -> Arc<RunnerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until end-of-stream or a loop-fatal error
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] on a source failure, a closed output queue, or
    /// a stage failure under [`FailurePolicy::Halt`]
    pub async fn run(self) -> Result<(), RunnerError> {
        let stage = self.stage.name().to_string();
        info!(runner = %self.id, stage = %stage, "runner started");

        loop {
            let task = match self.source.fetch().await {
                Ok(Fetched::Task(task)) => task,
                Ok(Fetched::EndOfStream) => {
                    info!(runner = %self.id, stage = %stage, "source exhausted, runner stopping");
                    return Ok(());
                }
                Err(err) => {
                    error!(runner = %self.id, stage = %stage, error = %err, "source failed, runner stopping");
                    return Err(err.into());
                }
            };
            self.metrics.record_fetch();
            debug!(runner = %self.id, stage = %stage, "sending task to stage");

            let fatal = match self.process_isolated(task).await {
                Ok(Some(result)) => {
                    self.metrics.record_processed(true);
                    debug!(runner = %self.id, stage = %stage, "stage returned a result");
                    self.forward(result, &stage).await
                }
                Ok(None) => {
                    self.metrics.record_processed(false);
                    debug!(runner = %self.id, stage = %stage, "stage returned nothing");
                    None
                }
                Err(err) => {
                    self.metrics.record_failure();
                    match self.policy {
                        FailurePolicy::Isolate => {
                            warn!(runner = %self.id, stage = %stage, error = %err, "task failed, continuing");
                            None
                        }
                        FailurePolicy::Halt => Some(RunnerError::Stage {
                            stage: stage.clone(),
                            source: err,
                        }),
                    }
                }
            };

            self.source.acknowledge();
            self.metrics.record_ack();

            if let Some(err) = fatal {
                error!(runner = %self.id, stage = %stage, error = %err, "runner stopping");
                return Err(err);
            }
        }
    }

    /// Call `process`, turning a panic into a [`StageError::Panicked`]
    async fn process_isolated(&self, task: T) -> Result<Option<R>, StageError> {
        AssertUnwindSafe(self.stage.process(task))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(StageError::Panicked(panic_message(payload.as_ref()))))
    }

    async fn forward(&self, result: R, stage: &str) -> Option<RunnerError> {
        let output = self.output.as_ref()?;
        match output.send(result).await {
            Ok(()) => {
                self.metrics.record_forward();
                None
            }
            Err(_) => Some(RunnerError::OutputClosed {
                stage: stage.to_string(),
            }),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
