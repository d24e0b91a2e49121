//! Work stages.

use async_trait::async_trait;

/// Stage errors
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The task did not carry what the stage needs
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Processing failed
    #[error("Processing failed: {0}")]
    Failed(String),

    /// The stage panicked while processing
    #[error("Stage panicked: {0}")]
    Panicked(String),

    /// Any other failure reported by a collaborator
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StageError {
    /// Shorthand for [`StageError::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Capability: consumes one task, optionally produces one result
///
/// `Ok(None)` means there is nothing to forward downstream. Stages may
/// suspend and may have side effects.
#[async_trait]
pub trait WorkStage<T: Send + 'static>: Send + Sync {
    /// Result forwarded to the next stage
    type Output: Send + 'static;

    /// Process a single task
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] if this task could not be processed
    async fn process(&self, task: T) -> Result<Option<Self::Output>, StageError>;

    /// Name used in logs and reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
