//! Outbound send credit granted by the peer's REQUEST_N frames.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::state::REQUEST_MAX;

/// A saturating credit counter with an async waiter.
///
/// One driver task consumes; `add` and `close` may be called from any
/// thread. The waiter uses `notify_one`, which stores a permit when nobody
/// is parked, so a grant racing the driver's check is never lost.
pub(crate) struct Credits {
    available: AtomicU64,
    wake: Notify,
}

impl Credits {
    pub fn new(initial: u32) -> Self {
        Self {
            available: AtomicU64::new(u64::from(initial)),
            wake: Notify::new(),
        }
    }

    /// Grant `n` more credits, saturating at the unbounded sentinel.
    pub fn add(&self, n: u32) {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let next = current
                .saturating_add(u64::from(n))
                .min(u64::from(REQUEST_MAX));
            match self
                .available
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.wake.notify_one();
    }

    /// Wake the driver so it can observe a terminal state.
    pub fn close(&self) {
        self.wake.notify_one();
    }

    /// Take one credit, waiting for a grant. Returns false once `dead`
    /// observes a terminal state.
    pub async fn take(&self, dead: impl Fn() -> bool) -> bool {
        loop {
            if dead() {
                return false;
            }
            if self.try_take() {
                return true;
            }
            self.wake.notified().await;
        }
    }

    fn try_take(&self) -> bool {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == u64::from(REQUEST_MAX) {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.available.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_drains() {
        let credits = Credits::new(REQUEST_MAX);
        for _ in 0..10 {
            assert!(credits.try_take());
        }
    }

    #[test]
    fn test_bounded_drains() {
        let credits = Credits::new(2);
        assert!(credits.try_take());
        assert!(credits.try_take());
        assert!(!credits.try_take());
        credits.add(1);
        assert!(credits.try_take());
    }

    #[tokio::test]
    async fn test_take_wakes_on_grant() {
        let credits = std::sync::Arc::new(Credits::new(0));
        let waiter = {
            let credits = credits.clone();
            tokio::spawn(async move { credits.take(|| false).await })
        };
        tokio::task::yield_now().await;
        credits.add(1);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_take_observes_death() {
        let credits = Credits::new(0);
        let dead = std::sync::atomic::AtomicBool::new(true);
        assert!(!credits.take(|| dead.load(Ordering::Relaxed)).await);
    }
}
