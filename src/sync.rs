//! Shared concurrency primitives used above the single-owner device layer.
//!
//! Everything below `crate::database` assumes one logical owner driving the
//! stream at a time; the query manager is what introduces concurrency, and
//! it needs two small primitives that don't already exist as a single
//! `tokio::sync` type: a cooperative cancellation signal, and an
//! event-waiter for "block until some predicate becomes true" (the manager
//! uses it to wait for its active-subscriber set to become non-empty).

use tokio::sync::watch;

/// A cooperative cancellation signal, cloneable and cheap to check.
///
/// Built on [`tokio::sync::watch`] rather than a `Notify` + `AtomicBool`
/// pair: a `watch` channel always holds its last value, so a task that
/// starts waiting *after* [`CancellationToken::cancel`] was already called
/// still observes it immediately, with no missed-wakeup window to reason
/// about.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Builds a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signals cancellation. Idempotent: cancelling twice has no additional
    /// effect.
    pub fn cancel(&self) {
        // Only fails if every receiver has been dropped, which just means
        // nothing is listening; cancellation still "happened".
        let _ = self.tx.send(true);
    }

    /// Reports whether [`CancellationToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been signalled. Resolves immediately
    /// if it already has been.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}
