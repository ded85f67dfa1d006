//! Tasks: the units of work launched into a stage.
//!
//! A task is anything that takes its stage's [`CancellationToken`] and
//! eventually resolves to `anyhow::Result<()>`. Plain async closures are
//! launched with [`Stage::go`](crate::Stage::go); types implementing [`Task`]
//! with [`Stage::go_task`](crate::Stage::go_task).
//!
//! Tasks must return promptly once their token is cancelled. Nothing enforces
//! this: a task that ignores cancellation blocks the stager's drain forever.

use crate::cancellation::CancellationToken;
use async_trait::async_trait;

/// Outcome produced by a task.
pub type TaskResult = anyhow::Result<()>;

/// Trait for callable structs that can run as a stage task.
#[async_trait]
pub trait Task: Send + 'static {
    /// Runs the task until it finishes or `token` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `token` - The scope of the stage the task was launched into
    async fn run(self: Box<Self>, token: CancellationToken) -> TaskResult;
}
