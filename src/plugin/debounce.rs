//! Last-call-wins coalescing for interactive updates.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default quiet interval for `update` calls.
pub const DEFAULT_UPDATE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Coalesces rapid calls so only the latest one runs.
///
/// Each call waits for the quiet interval; if another call arrived meanwhile
/// the earlier one resolves to `None` without running.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, generation: AtomicU64::new(0) }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `f`, running it only if no newer call supersedes it.
    pub async fn call<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mine = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;

        if self.generation.load(Ordering::SeqCst) != mine {
            tracing::trace!(generation = mine, "Debounced call superseded");
            return None;
        }
        Some(f().await)
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_DEBOUNCE)
    }
}
