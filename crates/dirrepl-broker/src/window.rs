//! Credit-based flow control between a replication server and its peers.
//!
//! Every peer advertises a window size in its start message. The sender side
//! ([`SendWindow`]) spends one credit per update and stalls when it runs out;
//! the receiver side ([`RecvWindow`]) counts consumed updates and hands back
//! credits in half-window chunks.

use crate::error::{BrokerError, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Default slice a blocked sender waits before re-checking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Credits we may spend sending updates to a peer.
#[derive(Debug)]
pub struct SendWindow {
    credits: AtomicU32,
    closed: AtomicBool,
    notify: Notify,
    poll_interval: Duration,
}

impl SendWindow {
    /// Create a window holding `initial` credits.
    pub fn new(initial: u32, poll_interval: Duration) -> Self {
        Self {
            credits: AtomicU32::new(initial),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            poll_interval,
        }
    }

    /// Take one credit if any is available.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.credits.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.credits.compare_exchange_weak(
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

    /// Take one credit, waiting in bounded slices until one is available.
    ///
    /// Fails with [`BrokerError::Shutdown`] once the window is closed.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Shutdown);
            }
            if self.try_acquire() {
                return Ok(());
            }
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }

    /// Add credits granted by a window message, saturating at `u32::MAX`.
    pub fn replenish(&self, credits: u32) {
        let _ = self
            .credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(credits))
            });
        self.notify.notify_waiters();
    }

    /// Wake every waiter and fail all further acquisitions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Credits currently available.
    pub fn available(&self) -> u32 {
        self.credits.load(Ordering::Acquire)
    }

    /// True after [`SendWindow::close`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Credits we granted a peer for updates it sends us.
#[derive(Debug)]
pub struct RecvWindow {
    size: u32,
    remaining: AtomicI64,
}

impl RecvWindow {
    /// Create a window of `size` credits.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            remaining: AtomicI64::new(size as i64),
        }
    }

    /// Account for one received update.
    ///
    /// Returns the credit to send back when the remaining window has dropped
    /// below half; the window is topped up by that amount.
    pub fn consume(&self) -> Option<u32> {
        let left = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        let half = (self.size / 2).max(1);
        if left < half as i64 {
            self.remaining.fetch_add(half as i64, Ordering::AcqRel);
            Some(half)
        } else {
            None
        }
    }

    /// Remaining credits the peer holds, as far as we know.
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Configured size.
    pub fn size(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    mod send_window {
        use super::*;

        #[test]
        fn test_try_acquire_stops_at_zero() {
            let window = SendWindow::new(2, DEFAULT_POLL_INTERVAL);
            assert!(window.try_acquire());
            assert!(window.try_acquire());
            assert!(!window.try_acquire());
            assert_eq!(window.available(), 0);
        }

        #[tokio::test]
        async fn test_acquire_waits_for_replenish() {
            let window = Arc::new(SendWindow::new(0, Duration::from_millis(10)));
            let waiter = {
                let window = Arc::clone(&window);
                tokio::spawn(async move { window.acquire().await })
            };
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(!waiter.is_finished());

            window.replenish(1);
            waiter.await.unwrap().unwrap();
            assert_eq!(window.available(), 0);
        }

        #[test]
        fn test_replenish_saturates() {
            let window = SendWindow::new(10, DEFAULT_POLL_INTERVAL);
            window.replenish(u32::MAX);
            assert_eq!(window.available(), u32::MAX);
            window.replenish(5);
            assert_eq!(window.available(), u32::MAX);
            assert!(window.try_acquire());
            assert_eq!(window.available(), u32::MAX - 1);
        }

        #[tokio::test]
        async fn test_close_releases_waiter() {
            let window = Arc::new(SendWindow::new(0, Duration::from_millis(10)));
            let waiter = {
                let window = Arc::clone(&window);
                tokio::spawn(async move { window.acquire().await })
            };
            window.close();
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(BrokerError::Shutdown)));
            assert!(window.is_closed());
        }

        #[tokio::test]
        async fn test_concurrent_acquire_never_overspends() {
            let window = Arc::new(SendWindow::new(50, Duration::from_millis(5)));
            let mut handles = Vec::new();
            for _ in 0..10 {
                let window = Arc::clone(&window);
                handles.push(tokio::spawn(async move {
                    let mut got = 0;
                    while window.try_acquire() {
                        got += 1;
                    }
                    got
                }));
            }
            let mut total = 0;
            for handle in handles {
                total += handle.await.unwrap();
            }
            assert_eq!(total, 50);
            assert_eq!(window.available(), 0);
        }
    }

    mod recv_window {
        use super::*;

        #[test]
        fn test_credit_returned_below_half() {
            let window = RecvWindow::new(10);
            for _ in 0..5 {
                assert_eq!(window.consume(), None);
            }
            assert_eq!(window.consume(), Some(5));
            assert_eq!(window.remaining(), 9);
        }

        #[test]
        fn test_tiny_window() {
            let window = RecvWindow::new(1);
            assert_eq!(window.consume(), Some(1));
            assert_eq!(window.remaining(), 1);
            assert_eq!(window.size(), 1);
        }
    }
}
