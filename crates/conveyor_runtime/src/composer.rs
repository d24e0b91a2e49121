//! Pipeline composition.
//!
//! The composer starts one runner per processor stage, all competing on the
//! caller's source. When output handlers are supplied it also creates an
//! intermediate queue: every processor forwards into it and every handler
//! competes on it.
//!
//! The composer keeps no sender for the intermediate queue. Once the last
//! processor returns, its sender is dropped, the queue closes and the handlers
//! drain the backlog and stop. A finite source therefore shuts the whole
//! pipeline down without any extra signalling.

use std::sync::Arc;

use tracing::info;

use crate::pipeline::{Pipeline, RunnerHandle, StageGroup};
use crate::queue::{QueueCapacity, task_queue};
use crate::runner::{FailurePolicy, StageRunner};
use crate::source::TaskSource;
use crate::stage::WorkStage;

/// Composer configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComposerConfig {
    /// Capacity of the intermediate queue
    pub queue_capacity: QueueCapacity,
    /// Failure policy applied to every runner
    pub failure_policy: FailurePolicy,
}

impl ComposerConfig {
    /// Set the intermediate queue capacity
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the failure policy
    #[must_use]
    pub const fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Wires stages into running pools
#[derive(Debug, Clone, Default)]
pub struct Composer {
    config: ComposerConfig,
}

impl Composer {
    /// Create a composer
    #[must_use]
    pub const fn new(config: ComposerConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Start one runner per processor, all reading `source`
    ///
    /// Processor results are discarded.
    pub fn run<T, R>(
        &self,
        source: Arc<dyn TaskSource<T>>,
        processors: Vec<Box<dyn WorkStage<T, Output = R>>>,
    ) -> Pipeline
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let runners: Vec<_> = processors
            .into_iter()
            .map(|stage| {
                let runner = StageRunner::new(Arc::clone(&source), stage)
                    .with_failure_policy(self.config.failure_policy);
                RunnerHandle::spawn(runner, StageGroup::Processor)
            })
            .collect();

        info!("started {} processor(s)", runners.len());
        Pipeline::new(runners, None)
    }

    /// Start processors reading `source` and output handlers reading their
    /// results
    ///
    /// With no output handlers this is the same as [`Composer::run`].
    pub fn run_with_handlers<T, R, O>(
        &self,
        source: Arc<dyn TaskSource<T>>,
        processors: Vec<Box<dyn WorkStage<T, Output = R>>>,
        output_handlers: Vec<Box<dyn WorkStage<R, Output = O>>>,
    ) -> Pipeline
    where
        T: Send + 'static,
        R: Send + 'static,
        O: Send + 'static,
    {
        if output_handlers.is_empty() {
            return self.run(source, processors);
        }

        let (sender, queue) = task_queue::<R>(self.config.queue_capacity);
        let probe = queue.probe();
        let queue: Arc<dyn TaskSource<R>> = Arc::new(queue);

        let mut runners = Vec::with_capacity(processors.len() + output_handlers.len());
        for stage in processors {
            let runner = StageRunner::new(Arc::clone(&source), stage)
                .with_output(sender.clone())
                .with_failure_policy(self.config.failure_policy);
            runners.push(RunnerHandle::spawn(runner, StageGroup::Processor));
        }
        // Only the processors may hold senders, or the queue never closes.
        drop(sender);

        let processor_count = runners.len();
        for stage in output_handlers {
            let runner = StageRunner::new(Arc::clone(&queue), stage)
                .with_failure_policy(self.config.failure_policy);
            runners.push(RunnerHandle::spawn(runner, StageGroup::OutputHandler));
        }

        info!(
            queue = %self.config.queue_capacity,
            "started {} processor(s) and {} output handler(s)",
            processor_count,
            runners.len() - processor_count
        );
        Pipeline::new(runners, Some(probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerError;
    use crate::source::IterSource;
    use crate::stage::StageError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    type Collected = Arc<Mutex<Vec<u32>>>;

    struct Collect {
        into: Collected,
    }

    #[async_trait]
    impl WorkStage<u32> for Collect {
        type Output = ();

        async fn process(&self, task: u32) -> Result<Option<()>, StageError> {
            tokio::task::yield_now().await;
            self.into.lock().unwrap().push(task);
            Ok(None)
        }
    }

    /// Doubles even tasks, drops odd ones
    struct DoubleEven;

    #[async_trait]
    impl WorkStage<u32> for DoubleEven {
        type Output = u32;

        async fn process(&self, task: u32) -> Result<Option<u32>, StageError> {
            Ok((task % 2 == 0).then_some(task * 2))
        }
    }

    struct Stall;

    #[async_trait]
    impl WorkStage<u32> for Stall {
        type Output = u32;

        async fn process(&self, task: u32) -> Result<Option<u32>, StageError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(task))
        }
    }

    struct Hold;

    #[async_trait]
    impl WorkStage<u32> for Hold {
        type Output = ();

        async fn process(&self, _task: u32) -> Result<Option<()>, StageError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    fn collectors(n: usize, into: &Collected) -> Vec<Box<dyn WorkStage<u32, Output = ()>>> {
        (0..n)
            .map(|_| Box::new(Collect { into: Arc::clone(into) }) as Box<dyn WorkStage<u32, Output = ()>>)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_competing_processors_see_each_task_once() {
        let seen: Collected = Arc::default();
        let composer = Composer::default();

        let pipeline = composer.run(Arc::new(IterSource::new(0..200)), collectors(5, &seen));
        assert_eq!(pipeline.len(), 5);
        assert!(pipeline.queue().is_none());

        let reports = pipeline.join().await;
        assert!(reports.iter().all(|r| r.is_clean()));

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());

        let acknowledged: u64 = reports.iter().map(|r| r.metrics.acknowledged).sum();
        assert_eq!(acknowledged, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_stage_forwards_only_results() {
        let seen: Collected = Arc::default();
        let composer = Composer::new(ComposerConfig::default().with_queue_capacity(QueueCapacity::bounded(4)));

        let processors: Vec<Box<dyn WorkStage<u32, Output = u32>>> =
            vec![Box::new(DoubleEven), Box::new(DoubleEven), Box::new(DoubleEven)];
        let pipeline =
            composer.run_with_handlers(Arc::new(IterSource::new(0..100)), processors, collectors(2, &seen));
        assert_eq!(pipeline.len(), 5);
        let probe = pipeline.queue().cloned().unwrap();

        // The source is finite, so the whole pipeline winds down on its own.
        let reports = pipeline.join().await;
        assert!(reports.iter().all(|r| r.is_clean()));

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).filter(|n| n % 2 == 0).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(probe.depth(), 0);
        assert_eq!(probe.unfinished(), 0);

        let handler_fetches: u64 = reports
            .iter()
            .filter(|r| r.group == StageGroup::OutputHandler)
            .map(|r| r.metrics.fetched)
            .sum();
        assert_eq!(handler_fetches, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_report_intermediate_queue_fill() {
        let composer = Composer::new(ComposerConfig::default().with_queue_capacity(QueueCapacity::bounded(4)));
        let processors: Vec<Box<dyn WorkStage<u32, Output = u32>>> = vec![Box::new(DoubleEven)];
        let handlers: Vec<Box<dyn WorkStage<u32, Output = ()>>> = vec![Box::new(Hold)];

        let pipeline = composer.run_with_handlers(Arc::new(IterSource::new(0..10)), processors, handlers);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Five results forwarded: one held by the handler, four buffered.
        let metrics = pipeline.metrics();
        assert_eq!(metrics.processors.processed, 10);
        assert_eq!(metrics.processors.success_rate(), 1.0);
        assert_eq!(metrics.output_handlers.fetched, 1);
        assert_eq!(metrics.queue_depth, Some(4));
        assert_eq!(metrics.queue_fill, Some(1.0));

        pipeline.abort();
        pipeline.join().await;
    }

    #[tokio::test]
    async fn test_empty_handlers_fall_back_to_single_stage() {
        let seen: Collected = Arc::default();
        let composer = Composer::default();

        let pipeline = composer.run_with_handlers::<u32, (), ()>(
            Arc::new(IterSource::new(0..10)),
            collectors(2, &seen),
            Vec::new(),
        );
        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.queue().is_none());

        pipeline.join().await;
        assert_eq!(seen.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_no_processors_closes_handlers_immediately() {
        let seen: Collected = Arc::default();
        let composer = Composer::default();

        let pipeline = composer.run_with_handlers::<u32, u32, ()>(
            Arc::new(IterSource::new(0..10)),
            Vec::new(),
            collectors(2, &seen),
        );

        let reports = pipeline.join().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_clean()));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_all_runners() {
        let seen: Collected = Arc::default();
        let composer = Composer::default();
        let processors: Vec<Box<dyn WorkStage<u32, Output = u32>>> = vec![Box::new(Stall), Box::new(Stall)];

        let pipeline = composer.run_with_handlers(Arc::new(IterSource::new(0..10)), processors, collectors(1, &seen));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pipeline.is_finished());
        assert_eq!(pipeline.metrics().processors.fetched, 2);

        pipeline.abort();
        let reports = pipeline.join().await;
        assert!(
            reports
                .iter()
                .all(|r| matches!(r.outcome, Err(RunnerError::Aborted { .. })))
        );
        assert!(seen.lock().unwrap().is_empty());
    }
}
