//! Cancellation tokens for long-running control-plane operations.
//!
//! Every suspension point (provider confirmation, health bake, event
//! wait) takes a `CancelToken`. Cancellation is a distinct outcome from
//! a deadline expiring; callers surface the two as different errors.

use tokio::sync::watch;

/// Owning side of a cancellation signal.
///
/// Dropping the source does NOT cancel outstanding tokens; cancellation
/// is always an explicit `cancel()` call.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Cloneable handle observed by in-flight operations.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    /// Create a source and its first token.
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Signal cancellation to every token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that can never be cancelled, for callers without a signal.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// If the source is dropped without cancelling, this pends forever;
    /// callers always race it against their own deadline.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Source dropped without cancelling.
        std::future::pending::<()>().await;
    }
}
