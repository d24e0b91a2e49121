//! Conveyor Runtime
//!
//! In-process orchestration core: stage runners that drive a [`TaskSource`]
//! against a [`WorkStage`], a [`Composer`] wiring competing-consumer pools
//! (optionally chained through an intermediate queue), and a
//! [`PeriodicScheduler`] that injects work on drift-corrected calendar
//! intervals.
//!
//! ```text
//! PeriodicScheduler ──▶ TaskQueue ──▶ N × StageRunner ──▶ TaskQueue ──▶ M × StageRunner
//!                                     (processors)                     (output handlers)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod composer;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod source;
pub mod stage;

pub use clock::{AnchoredClock, Clock, SystemClock};
pub use composer::{Composer, ComposerConfig};
pub use monitor::{MetricsSnapshot, PipelineMetrics, RunnerMetrics};
pub use pipeline::{Pipeline, RunnerHandle, RunnerReport, StageGroup};
pub use queue::{QueueCapacity, QueueError, QueueProbe, QueueSender, QueueSource, task_queue};
pub use runner::{FailurePolicy, RunnerError, StageRunner};
pub use scheduler::{JobError, JobHandle, PeriodicScheduler, ScheduleError, next_fire_time};
pub use source::{Fetched, IterSource, SourceError, TaskSource};
pub use stage::{StageError, WorkStage};
