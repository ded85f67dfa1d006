//! Configuration for a [`Stager`](crate::Stager).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stager configuration.
///
/// Every field has a default, so a partial document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagerConfig {
    /// Label attached to the run's log span.
    #[serde(default = "default_name")]
    pub name: String,
    /// Seconds a stage may spend draining before a warning is logged.
    /// The warning repeats every interval. `None` disables it.
    #[serde(default = "default_slow_drain_warning")]
    pub slow_drain_warning_seconds: Option<f64>,
}

fn default_name() -> String {
    "stager".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_slow_drain_warning() -> Option<f64> {
    Some(10.0)
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            slow_drain_warning_seconds: default_slow_drain_warning(),
        }
    }
}

impl StagerConfig {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the slow drain warning interval.
    #[must_use]
    pub fn with_slow_drain_warning(mut self, interval: Duration) -> Self {
        self.slow_drain_warning_seconds = Some(interval.as_secs_f64());
        self
    }

    /// Disables the slow drain warning.
    #[must_use]
    pub fn without_slow_drain_warning(mut self) -> Self {
        self.slow_drain_warning_seconds = None;
        self
    }

    /// Returns the slow drain warning interval.
    ///
    /// Zero, negative and non-finite values disable the warning.
    #[must_use]
    pub fn slow_drain_warning(&self) -> Option<Duration> {
        self.slow_drain_warning_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|interval| !interval.is_zero())
    }
}
