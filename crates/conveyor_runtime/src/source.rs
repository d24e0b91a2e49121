//! Task sources.
//!
//! A [`TaskSource`] hands out tasks one at a time to whichever runner calls
//! [`TaskSource::fetch`] first. Running out of work is an ordinary value,
//! [`Fetched::EndOfStream`], not an error.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Outcome of a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    /// Next task
    Task(T),
    /// No more tasks will ever be produced
    EndOfStream,
}

impl<T> Fetched<T> {
    /// Extract the task, if any
    pub fn into_task(self) -> Option<T> {
        match self {
            Self::Task(task) => Some(task),
            Self::EndOfStream => None,
        }
    }

    /// True for [`Fetched::EndOfStream`]
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Source-level failures
///
/// Unlike end-of-stream, these stop the runner that observed them.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Upstream is temporarily or permanently unreachable
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// Any other failure reported by a collaborator
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Capability: yields tasks one at a time
///
/// Implementations are shared between competing runners, so `fetch` takes
/// `&self` and each task must be delivered to exactly one caller.
#[async_trait]
pub trait TaskSource<T: Send + 'static>: Send + Sync {
    /// Suspend until a task is available or the stream has ended
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the source itself has failed
    async fn fetch(&self) -> Result<Fetched<T>, SourceError>;

    /// Mark the most recently fetched task as done
    ///
    /// Called exactly once per fetched task, whatever the processing outcome.
    fn acknowledge(&self) {}
}

/// Finite in-memory source
///
/// Yields the given tasks in order, then reports end-of-stream on every
/// subsequent fetch.
pub struct IterSource<T> {
    tasks: Mutex<VecDeque<T>>,
}

impl<T: Send + 'static> IterSource<T> {
    /// Create a source over `tasks`
    pub fn new(tasks: impl IntoIterator<Item = T>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into_iter().collect()),
        }
    }

    /// Number of tasks not yet fetched
    pub async fn remaining(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl<T: Send + 'static> TaskSource<T> for IterSource<T> {
    async fn fetch(&self) -> Result<Fetched<T>, SourceError> {
        Ok(match self.tasks.lock().await.pop_front() {
            Some(task) => Fetched::Task(task),
            None => Fetched::EndOfStream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iter_source_yields_in_order() {
        let source = IterSource::new(vec![1, 2, 3]);
        assert_eq!(source.remaining().await, 3);

        assert_eq!(source.fetch().await.unwrap(), Fetched::Task(1));
        assert_eq!(source.fetch().await.unwrap(), Fetched::Task(2));
        assert_eq!(source.fetch().await.unwrap(), Fetched::Task(3));
        assert_eq!(source.remaining().await, 0);
    }

    #[tokio::test]
    async fn test_iter_source_keeps_reporting_end_of_stream() {
        let source = IterSource::new(Vec::<u8>::new());
        for _ in 0..3 {
            assert!(source.fetch().await.unwrap().is_end_of_stream());
        }
    }

    #[test]
    fn test_fetched_into_task() {
        assert_eq!(Fetched::Task("a").into_task(), Some("a"));
        assert_eq!(Fetched::<&str>::EndOfStream.into_task(), None);
    }

    #[test]
    fn test_source_error_from_boxed() {
        let boxed: Box<dyn std::error::Error + Send + Sync> = "broker gone".into();
        let err = SourceError::from(boxed);
        assert_eq!(err.to_string(), "broker gone");
    }
}
