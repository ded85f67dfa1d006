//! The stager: creates stages in order and tears them down in reverse.

use crate::cancellation::CancellationToken;
use crate::config::StagerConfig;
use crate::errors::StagerError;
use crate::stage::Stage;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Reason recorded on the run scope when the caller's token stops the run.
const EXTERNAL_SHUTDOWN: &str = "external shutdown requested";

/// Top-level coordinator for staged startup and reverse-order shutdown.
///
/// Stages are created in order with [`next_stage`](Self::next_stage). Once
/// [`run`](Self::run) observes a stop condition it cancels the stages from
/// the last created to the first, waiting for every task of a stage to
/// return before touching the previous one. Typically stage 1 holds
/// low-level resources and later stages hold their consumers.
///
/// A failure in any task stops the run. `run` returns the first failure
/// collected during the drain.
pub struct Stager {
    config: StagerConfig,
    /// Append-only; creation order is shutdown order reversed.
    stages: Vec<Stage>,
    /// Cancelled by any task failure, by `shutdown_trigger`, or when `run` stops.
    run_token: CancellationToken,
    run_id: Uuid,
}

impl Stager {
    /// Creates a stager with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StagerConfig::default())
    }

    /// Creates a stager with the given configuration.
    #[must_use]
    pub fn with_config(config: StagerConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            run_token: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Creates the next stage with an independent root scope.
    pub fn next_stage(&mut self) -> Stage {
        self.push_stage(None, CancellationToken::new())
    }

    /// Creates the next stage with a name used in logs.
    pub fn next_named_stage(&mut self, name: impl Into<String>) -> Stage {
        self.push_stage(Some(name.into()), CancellationToken::new())
    }

    /// Creates the next stage with a scope derived from `parent`.
    ///
    /// Tasks in the stage observe cancellation when `parent` is cancelled or
    /// when the stage's turn to drain comes, whichever happens first.
    pub fn next_stage_with_token(&mut self, parent: &CancellationToken) -> Stage {
        self.push_stage(None, parent.child_token())
    }

    fn push_stage(&mut self, name: Option<String>, token: CancellationToken) -> Stage {
        let stage = Stage::new(self.stages.len() + 1, name, token, self.run_token.clone());
        self.stages.push(stage.clone());
        stage
    }

    /// Returns the number of stages created so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StagerConfig {
        &self.config
    }

    /// Returns the id attached to this run's log span.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns a handle to the run scope.
    ///
    /// Cancelling it stops the run the same way a task failure does, without
    /// producing a failure. Awaiting it tells when shutdown has begun.
    #[must_use]
    pub fn shutdown_trigger(&self) -> CancellationToken {
        self.run_token.clone()
    }

    /// Runs until `external` is cancelled or a task fails, then shuts down.
    ///
    /// Stages are drained from the last created to the first. Each stage's
    /// scope is cancelled only after every later stage has fully drained.
    /// Consuming `self` makes a second run, or creating stages afterwards,
    /// impossible.
    ///
    /// Blocks forever if a task never returns after its scope is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the first task failure collected during the drain. Later
    /// stages are drained first, so their failures take precedence.
    pub async fn run(self, external: &CancellationToken) -> Result<(), StagerError> {
        let span = info_span!(
            "stager_run",
            stager = %self.config.name,
            run_id = %self.run_id,
            stages = self.stages.len(),
        );
        self.run_to_completion(external).instrument(span).await
    }

    async fn run_to_completion(self, external: &CancellationToken) -> Result<(), StagerError> {
        info!("Stager running");

        tokio::select! {
            () = external.cancelled() => {
                info!(reason = ?external.reason(), "Stop requested by caller");
            }
            () = self.run_token.cancelled() => {
                info!(reason = ?self.run_token.reason(), "Stop requested by run scope");
            }
        }
        self.run_token.cancel(EXTERNAL_SHUTDOWN);

        let slow_warning = self.config.slow_drain_warning();
        let mut first_error = None;
        for stage in self.stages.iter().rev() {
            stage.drain(slow_warning, &mut first_error).await;
        }

        match first_error {
            Some(err) => {
                warn!(error = %err, "Stager terminated with failure");
                Err(err)
            }
            None => {
                info!("Stager terminated");
                Ok(())
            }
        }
    }
}

impl Default for Stager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Stager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stager")
            .field("name", &self.config.name)
            .field("run_id", &self.run_id)
            .field("stages", &self.stages.len())
            .field("stopping", &self.run_token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_stages_are_indexed_in_creation_order() {
        let mut stager = Stager::new();
        let first = stager.next_stage();
        let second = stager.next_named_stage("consumers");
        let parent = CancellationToken::new();
        let third = stager.next_stage_with_token(&parent);

        assert_eq!(stager.stage_count(), 3);
        assert_eq!(
            [first.index(), second.index(), third.index()],
            [1, 2, 3]
        );
        assert_eq!(second.name(), Some("consumers"));
        assert_eq!(first.name(), None);
    }

    #[test]
    fn test_stage_scopes_are_independent_of_run_scope() {
        let mut stager = Stager::new();
        let stage = stager.next_stage();

        stager.shutdown_trigger().cancel("stop");
        assert!(!stage.token().is_cancelled());
    }

    #[test]
    fn test_derived_stage_follows_parent() {
        let mut stager = Stager::new();
        let parent = CancellationToken::new();
        let stage = stager.next_stage_with_token(&parent);

        parent.cancel("deadline");
        assert!(stage.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_trigger_stops_run_without_failure() {
        let mut stager = Stager::new();
        let stage = stager.next_stage();
        stage
            .go(|token| async move {
                token.cancelled().await;
                Ok(())
            })
            .unwrap();

        let trigger = stager.shutdown_trigger();
        let external = CancellationToken::new();
        let run = tokio::spawn(async move { stager.run(&external).await });

        trigger.cancel("operator request");
        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run should finish")
            .expect("run should not panic");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_cancels_run_scope_on_external_stop() {
        let stager = Stager::with_config(StagerConfig::new().with_name("unit"));
        let trigger = stager.shutdown_trigger();
        let external = CancellationToken::new();
        external.cancel("signal");

        stager.run(&external).await.unwrap();
        assert!(trigger.is_cancelled());
        assert_eq!(trigger.reason(), Some(EXTERNAL_SHUTDOWN.to_string()));
    }

    #[test]
    fn test_config_and_run_id_accessors() {
        let first = Stager::with_config(StagerConfig::new().with_name("ingest"));
        let second = Stager::new();

        assert_eq!(first.config().name, "ingest");
        assert_eq!(second.config(), &StagerConfig::default());
        assert_ne!(first.run_id(), second.run_id());
        assert!(format!("{first:?}").contains(&first.run_id().to_string()));
    }

    #[test]
    fn test_debug_output() {
        let stager = Stager::with_config(StagerConfig::new().with_name("dbg"));
        let debug = format!("{stager:?}");
        assert!(debug.contains("\"dbg\""));
        assert!(debug.contains("stages: 0"));
    }
}
