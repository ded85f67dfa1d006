//! # Stager
//!
//! Staged lifecycle coordination for groups of concurrent tasks.
//!
//! A [`Stager`] groups tasks into ordered [`Stage`]s and guarantees that on
//! shutdown the stages are torn down strictly in reverse creation order, each
//! one fully drained before the previous one is cancelled:
//!
//! - **Ordered teardown**: the last stage created is the first cancelled
//! - **Failure as a stop signal**: any task failure triggers global shutdown
//! - **Single outcome**: `run` reports the first failure collected during the drain
//! - **Scoped cancellation**: a task only ever observes its own stage's token
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stager::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), StagerError> {
//! let mut stager = Stager::new();
//!
//! // Stage 1: low-level resources
//! let db = stager.next_stage();
//! db.go(|token| async move {
//!     token.cancelled().await;
//!     Ok(())
//! })?;
//!
//! // Stage 2: consumers, stopped before stage 1
//! let http = stager.next_stage();
//! http.go(|token| async move {
//!     token.cancelled().await;
//!     Ok(())
//! })?;
//!
//! let deadline = CancellationToken::with_timeout(Duration::from_secs(5));
//! stager.run(&deadline).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod stage;
pub mod stager;
pub mod task;

pub use cancellation::{CancellationToken, DEADLINE_EXCEEDED};
pub use config::StagerConfig;
pub use errors::StagerError;
pub use stage::Stage;
pub use stager::Stager;
pub use task::{Task, TaskResult};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, DEADLINE_EXCEEDED};
    pub use crate::config::StagerConfig;
    pub use crate::errors::StagerError;
    pub use crate::stage::Stage;
    pub use crate::stager::Stager;
    pub use crate::task::{Task, TaskResult};
}
