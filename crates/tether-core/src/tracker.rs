//! Resource accounting for raw connections and upgrade tasks.
//!
//! Every raw connection a dialer or listener opens is wrapped in a
//! [`TrackedConnection`], and every spawned upgrade task holds a
//! [`TaskGuard`]. Both decrement their counter on drop, so a tracker whose
//! live counts return to zero proves nothing outlived its owner.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tether_transport::{Address, BoxedConnection, RawConnection};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default)]
struct Counters {
    open_connections: AtomicUsize,
    live_tasks: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Shared counters; clones observe the same values.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    counters: Arc<Counters>,
}

/// Point-in-time view of a [`ResourceTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerSnapshot {
    /// Raw connections currently open
    pub open_connections: usize,
    /// Upgrade tasks currently running
    pub live_tasks: usize,
    /// Upgrades that produced a secure connection
    pub completed: u64,
    /// Upgrades that failed
    pub failed: u64,
    /// Upgrades that hit their deadline
    pub timed_out: u64,
}

impl ResourceTracker {
    /// Create a tracker with all counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a raw connection so it is counted until dropped
    #[must_use]
    pub fn track(&self, conn: BoxedConnection) -> BoxedConnection {
        self.counters.open_connections.fetch_add(1, Ordering::SeqCst);
        Box::new(TrackedConnection {
            inner: conn,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Count a running task until the guard is dropped
    #[must_use]
    pub fn task_guard(&self) -> TaskGuard {
        self.counters.live_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Record a successful upgrade
    pub fn record_completed(&self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed upgrade
    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upgrade that exceeded its deadline
    pub fn record_timed_out(&self) {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw connections currently open
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.counters.open_connections.load(Ordering::SeqCst)
    }

    /// Upgrade tasks currently running
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.counters.live_tasks.load(Ordering::SeqCst)
    }

    /// Whether nothing tracked is still alive
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.open_connections() == 0 && self.live_tasks() == 0
    }

    /// Snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            open_connections: self.open_connections(),
            live_tasks: self.live_tasks(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Wait until the tracker is idle, giving up after `grace`.
    ///
    /// Returns whether the tracker became idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Keeps a task counted in its [`ResourceTracker`] while alive.
#[derive(Debug)]
pub struct TaskGuard {
    counters: Arc<Counters>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counters.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Raw connection counted in a [`ResourceTracker`] until dropped.
pub struct TrackedConnection {
    inner: BoxedConnection,
    counters: Arc<Counters>,
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.counters.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RawConnection for TrackedConnection {
    fn local_addr(&self) -> &Address {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> &Address {
        self.inner.remote_addr()
    }
}

impl AsyncRead for TrackedConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_transport::{MemoryTransport, Transport};

    #[tokio::test]
    async fn test_tracked_connection_counts_until_drop() {
        let transport = MemoryTransport::new();
        let addr = Address::memory("tracked").unwrap();
        let _listener = transport.listen(&addr).await.unwrap();

        let tracker = ResourceTracker::new();
        let conn = tracker.track(transport.dial(&addr).await.unwrap());
        assert_eq!(tracker.open_connections(), 1);
        assert_eq!(conn.remote_addr(), &addr);

        drop(conn);
        assert_eq!(tracker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_task_guard_and_wait_idle() {
        let tracker = ResourceTracker::new();
        let guard = tracker.task_guard();
        assert_eq!(tracker.live_tasks(), 1);
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard);
        });
        assert!(tracker.wait_idle(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_outcome_counters() {
        let tracker = ResourceTracker::new();
        let clone = tracker.clone();
        tracker.record_completed();
        clone.record_failed();
        clone.record_failed();
        tracker.record_timed_out();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.open_connections, 0);
    }
}
