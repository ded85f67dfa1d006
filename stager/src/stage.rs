//! A stage: one cohort of tasks sharing a cancellation scope.

use crate::cancellation::CancellationToken;
use crate::errors::StagerError;
use crate::task::{Task, TaskResult};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Terminal outcome of one task.
type Outcome = Result<(), StagerError>;

/// Launch bookkeeping, guarded by one lock so sealing and launching never interleave.
struct StageState {
    /// Tasks launched so far.
    launched: usize,
    /// Receiving end of the outcome queue. Taken when the drain begins.
    outcomes: Option<mpsc::UnboundedReceiver<Outcome>>,
}

struct StageInner {
    /// 1-based creation index.
    index: usize,
    name: Option<String>,
    /// Scope handed to every task in this stage.
    token: CancellationToken,
    /// The owning stager's run scope. Cancelled on any task failure.
    run_token: CancellationToken,
    state: Mutex<StageState>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
}

/// A handle to a stage created by [`Stager`](crate::Stager).
///
/// Handles are cheap to clone. Tasks launched through any clone belong to the
/// same stage and are drained together when the stager shuts down.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    pub(crate) fn new(
        index: usize,
        name: Option<String>,
        token: CancellationToken,
        run_token: CancellationToken,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StageInner {
                index,
                name,
                token,
                run_token,
                state: Mutex::new(StageState {
                    launched: 0,
                    outcomes: Some(outcome_rx),
                }),
                outcome_tx,
            }),
        }
    }

    /// Launches `f` as a new task in this stage.
    ///
    /// `f` receives the stage's token and must return promptly once it is
    /// cancelled. If the task fails or panics, the stager begins shutdown.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StagerError::StageSealed`] if this stage has already begun draining.
    pub fn go<F, Fut>(&self, f: F) -> Result<(), StagerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let token = self.inner.token.clone();
        self.launch(async move { f(token).await })
    }

    /// Launches a [`Task`] implementation in this stage.
    ///
    /// # Errors
    ///
    /// Returns [`StagerError::StageSealed`] if this stage has already begun draining.
    pub fn go_task<T: Task>(&self, task: T) -> Result<(), StagerError> {
        let token = self.inner.token.clone();
        self.launch(Box::new(task).run(token))
    }

    fn launch<Fut>(&self, task: Fut) -> Result<(), StagerError>
    where
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let stage = self.inner.index;
        let mut state = self.inner.state.lock();
        if state.outcomes.is_none() {
            return Err(StagerError::StageSealed { stage });
        }
        state.launched += 1;

        let outcome_tx = self.inner.outcome_tx.clone();
        let run_token = self.inner.run_token.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(StagerError::Task(err)),
                Err(payload) => Err(StagerError::from_panic(stage, payload.as_ref())),
            };
            if let Err(ref err) = outcome {
                debug!(stage, error = %err, "Task failed, requesting shutdown");
                run_token.cancel(format!("task in stage {stage} failed: {err}"));
            }
            // Fails only if the stager was dropped without running.
            let _ = outcome_tx.send(outcome);
        });

        debug!(stage, launched = state.launched, "Task launched");
        Ok(())
    }

    /// Returns the 1-based creation index of this stage.
    #[must_use]
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Returns the stage name, if one was given.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Returns the stage's scope.
    ///
    /// Useful for deriving sub-scopes with [`CancellationToken::child_token`].
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Returns true once the stage has begun draining.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.state.lock().outcomes.is_none()
    }

    /// Seals the stage, cancels its scope and collects one outcome per launched task.
    ///
    /// The first failure collected is stored in `first_error` unless it already holds one.
    pub(crate) async fn drain(
        &self,
        slow_warning: Option<Duration>,
        first_error: &mut Option<StagerError>,
    ) {
        let stage = self.inner.index;
        let (launched, outcomes) = {
            let mut state = self.inner.state.lock();
            (state.launched, state.outcomes.take())
        };
        let Some(mut outcomes) = outcomes else {
            return;
        };

        debug!(stage, stage_name = ?self.inner.name, outstanding = launched, "Draining stage");
        self.inner.token.cancel(format!("stage {stage} shutting down"));

        let mut remaining = launched;
        while remaining > 0 {
            let received = match slow_warning {
                Some(interval) => match tokio::time::timeout(interval, outcomes.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        warn!(
                            stage,
                            stage_name = ?self.inner.name,
                            outstanding = remaining,
                            "Stage is slow to drain; waiting for tasks to return"
                        );
                        continue;
                    }
                },
                None => outcomes.recv().await,
            };
            // The stage holds a sender, so the queue never closes while we wait.
            let Some(outcome) = received else {
                break;
            };
            remaining -= 1;

            if let Err(err) = outcome {
                if first_error.is_none() {
                    debug!(stage, error = %err, "Recording first failure");
                    *first_error = Some(err);
                } else {
                    debug!(stage, error = %err, "Discarding later failure");
                }
            }
        }

        debug!(stage, "Stage drained");
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Stage")
            .field("index", &self.inner.index)
            .field("name", &self.inner.name)
            .field("launched", &state.launched)
            .field("sealed", &state.outcomes.is_none())
            .field("cancelled", &self.inner.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stage() -> (Stage, CancellationToken) {
        let run_token = CancellationToken::new();
        let stage = Stage::new(
            1,
            Some("test".to_string()),
            CancellationToken::new(),
            run_token.clone(),
        );
        (stage, run_token)
    }

    #[tokio::test]
    async fn test_empty_stage_drains_immediately() {
        let (stage, _) = stage();
        let mut first_error = None;

        tokio::time::timeout(Duration::from_millis(100), stage.drain(None, &mut first_error))
            .await
            .expect("empty drain should not block");
        assert!(first_error.is_none());
        assert!(stage.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_failure_cancels_run_token_only() {
        let (stage, run_token) = stage();

        stage.go(|_token| async { anyhow::bail!("boom") }).unwrap();

        tokio::time::timeout(Duration::from_secs(1), run_token.cancelled())
            .await
            .expect("run token should be cancelled by the failure");
        assert!(!stage.token().is_cancelled());
        assert_eq!(run_token.reason(), Some("task in stage 1 failed: boom".to_string()));
    }

    #[tokio::test]
    async fn test_success_does_not_cancel_run_token() {
        let (stage, run_token) = stage();
        stage.go(|_token| async { Ok(()) }).unwrap();

        let mut first_error = None;
        stage.drain(None, &mut first_error).await;

        assert!(first_error.is_none());
        assert!(!run_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_collects_every_outcome() {
        let (stage, _) = stage();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let finished = finished.clone();
            stage
                .go(move |token| async move {
                    token.cancelled().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        let mut first_error = None;
        stage.drain(None, &mut first_error).await;

        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert!(first_error.is_none());
    }

    #[tokio::test]
    async fn test_drain_keeps_existing_error() {
        let (stage, _) = stage();
        stage
            .go(|token| async move {
                token.cancelled().await;
                anyhow::bail!("late")
            })
            .unwrap();

        let mut first_error = Some(StagerError::from(anyhow::anyhow!("early")));
        stage.drain(None, &mut first_error).await;

        assert_eq!(first_error.unwrap().to_string(), "early");
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (stage, run_token) = stage();
        stage
            .go(|token| async move {
                if !token.is_cancelled() {
                    panic!("task exploded");
                }
                Ok(())
            })
            .unwrap();

        // The panic must land before the drain cancels the stage token.
        tokio::time::timeout(Duration::from_secs(1), run_token.cancelled())
            .await
            .expect("panic should cancel the run token");

        let mut first_error = None;
        stage.drain(None, &mut first_error).await;

        assert!(run_token.is_cancelled());
        assert!(matches!(
            first_error,
            Some(StagerError::TaskPanicked { stage: 1, ref message }) if message == "task exploded"
        ));
    }

    #[tokio::test]
    async fn test_sealed_stage_rejects_tasks() {
        let (stage, _) = stage();
        let mut first_error = None;
        stage.drain(None, &mut first_error).await;

        assert!(stage.is_sealed());
        let result = stage.go(|_token| async { Ok(()) });
        assert!(matches!(result, Err(StagerError::StageSealed { stage: 1 })));
    }

    #[tokio::test]
    async fn test_slow_drain_keeps_waiting() {
        let (stage, _) = stage();
        stage
            .go(|token| async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(())
            })
            .unwrap();

        let mut first_error = None;
        stage
            .drain(Some(Duration::from_millis(5)), &mut first_error)
            .await;
        assert!(first_error.is_none());
    }

    #[test]
    fn test_debug_output() {
        let (stage, _) = stage();
        let debug = format!("{stage:?}");
        assert!(debug.contains("index: 1"));
        assert!(debug.contains("sealed: false"));
    }
}
