//! Cancellation scopes shared by the stager and its stages.
//!
//! A [`CancellationToken`] is the only stop signal a task ever receives.

mod token;

pub use token::{CancelCallback, CancellationToken, DEADLINE_EXCEEDED};
