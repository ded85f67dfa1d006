//! Cancellation token for cooperative cancellation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A callback type for cancellation notifications. Receives the cancellation reason.
pub type CancelCallback = Box<dyn FnOnce(&str) + Send>;

/// Reason recorded when a deadline armed with [`CancellationToken::cancel_after`] fires.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

struct TokenState {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: Mutex<Option<String>>,
    /// Who to notify on cancellation. Drained on first cancel.
    listeners: Mutex<Listeners>,
    /// Done signal for async waiters.
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct Listeners {
    callbacks: Vec<CancelCallback>,
    /// Child tokens. Dropped children are pruned whenever a new child registers.
    children: Vec<Weak<TokenState>>,
}

/// A cloneable scope for cooperative cancellation.
///
/// Clones share the same state. Cancellation is idempotent and monotonic:
/// only the first reason is kept and a cancelled token never becomes live again.
/// Tokens form a tree through [`child_token`](Self::child_token); cancelling a
/// parent cancels every child, never the other way round.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a new root token.
    #[must_use]
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                listeners: Mutex::new(Listeners::default()),
                done,
            }),
        }
    }

    /// Creates a root token that cancels itself after `duration`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_timeout(duration: Duration) -> Self {
        let token = Self::new();
        token.cancel_after(duration);
        token
    }

    /// Creates a child token.
    ///
    /// The child is cancelled whenever this token is, with the same reason.
    /// If this token is already cancelled the child starts out cancelled.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        {
            let mut listeners = self.state.listeners.lock();
            if !self.state.cancelled.load(Ordering::SeqCst) {
                listeners.children.retain(|weak| weak.strong_count() > 0);
                listeners.children.push(Arc::downgrade(&child.state));
                return child;
            }
        }
        child.cancel(self.reason().unwrap_or_default());
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let listeners = {
            let mut listeners = self.state.listeners.lock();
            if self.state.cancelled.load(Ordering::SeqCst) {
                return;
            }
            *self.state.reason.lock() = Some(reason.clone());
            self.state.cancelled.store(true, Ordering::SeqCst);
            std::mem::take(&mut *listeners)
        };

        debug!(
            reason = %reason,
            callbacks = listeners.callbacks.len(),
            children = listeners.children.len(),
            "Token cancelled"
        );
        self.state.done.send_replace(true);

        for state in listeners.children.iter().filter_map(Weak::upgrade) {
            Self { state }.cancel(reason.as_str());
        }
        for callback in listeners.callbacks {
            invoke(callback, &reason);
        }
    }

    /// Arms a deadline that cancels this token after `duration`.
    ///
    /// The timer does not keep the token alive. Must be called from within a
    /// tokio runtime.
    pub fn cancel_after(&self, duration: Duration) {
        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(state) = weak.upgrade() {
                Self { state }.cancel(DEADLINE_EXCEEDED);
            }
        });
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        {
            let mut listeners = self.state.listeners.lock();
            if !self.state.cancelled.load(Ordering::SeqCst) {
                listeners.callbacks.push(Box::new(callback));
                return;
            }
        }
        let reason = self.reason().unwrap_or_default();
        invoke(Box::new(callback), &reason);
    }

    /// Waits until cancellation has been requested.
    ///
    /// Resolves immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        let mut done = self.state.done.subscribe();
        // The sender lives in `self.state`, so the channel cannot close while we wait.
        let _ = done.wait_for(|cancelled| *cancelled).await;
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.reason.lock().clone()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

fn invoke(callback: CancelCallback, reason: &str) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(reason);
    })) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}
