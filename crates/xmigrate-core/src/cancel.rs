//! Run-level cancellation.
//!
//! A [`CancellationToken`] is cloned into the orchestrator and whoever wants
//! to stop the run (the CLI's Ctrl-C handler). Cancelling stops dispatch of
//! new units; in-flight units are allowed to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token for cooperative cancellation of a migration run.
///
/// When `cancel()` is called on any clone, all clones observe it.
///
/// # Example
///
/// ```
/// use xmigrate_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every task waiting in [`cancelled`].
    ///
    /// [`cancelled`]: CancellationToken::cancelled
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::MigrateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
