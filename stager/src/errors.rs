//! Error types for the stager.
//!
//! A task failure is the only kind of failure the coordinator knows about.
//! Panics are folded into it, and sealed stages reject late launches.

use thiserror::Error;

/// The error type for stager operations.
#[derive(Debug, Error)]
pub enum StagerError {
    /// A task returned a failure. Displays as the task's own error.
    #[error(transparent)]
    Task(#[from] anyhow::Error),

    /// A task panicked instead of returning.
    #[error("Task in stage {stage} panicked: {message}")]
    TaskPanicked {
        /// Index of the stage the task was launched into (1-based).
        stage: usize,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A task was launched into a stage that has already begun draining.
    #[error("Stage {stage} is draining and no longer accepts tasks")]
    StageSealed {
        /// Index of the sealed stage (1-based).
        stage: usize,
    },
}

impl StagerError {
    /// Creates a task panicked error from a panic payload.
    #[must_use]
    pub fn from_panic(stage: usize, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        Self::TaskPanicked { stage, message }
    }

    /// Returns true if this error came from a task (returned or panicked).
    #[must_use]
    pub const fn is_task_failure(&self) -> bool {
        matches!(self, Self::Task(_) | Self::TaskPanicked { .. })
    }
}
