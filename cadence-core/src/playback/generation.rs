//! Generation-token cancellation.
//!
//! Every cancellable activity (a playback, a keyer attempt, a flash fade, a
//! torch hold) captures the current token when it starts. Cancelling means
//! advancing the counter; every wait re-checks its captured token and gives
//! up silently once it is stale. There is no other cancellation path.
//!
//! Backed by a `watch` channel so a pending wait wakes as soon as the token
//! moves instead of sleeping out its full deadline.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Generation {
    tx: Arc<watch::Sender<u64>>,
}

impl Generation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Invalidate every outstanding token and return the new one.
    pub fn advance(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|g| {
            *g = g.wrapping_add(1);
            next = *g;
        });
        next
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.current() == token
    }

    /// Sleep until `deadline`. Returns `false` (early) if `token` goes stale.
    pub async fn sleep_until(&self, token: u64, deadline: Instant) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() != token {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return self.is_current(token),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Resolve once `token` is stale.
    pub async fn cancelled(&self, token: u64) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() == token {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Generation").field(&self.current()).finish()
    }
}
