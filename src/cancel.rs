//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a cheap, clonable handle over a shared flag. Cancellation never interrupts anything by
//! force: long-running loops check [`CancelToken::is_cancelled`] at well-defined points, and waits (backoffs, remote
//! calls, cadence sleeps) race against [`CancelToken::cancelled`].

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the token is cancelled. Resolves immediately if that has already happened.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so `wait_for` can only fail if it's dropped, which it isn't.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
