//! Pre-operational connection tracker & stale-connection reaper (spec §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A handle a caller can use to ask the tracker to close an entry (a TLS
/// stream, conceptually). Kept generic over anything that can be asked to
/// shut down so tests can use a lightweight double.
pub trait Closeable: Send + Sync {
    fn close(&self);
}

struct Entry {
    conn: Arc<dyn Closeable>,
    added_at: Instant,
}

/// Tracks connections that are in the commissioning/cert-exchange phase but
/// have not yet graduated to an operational zone session (spec §3
/// invariant: "A connection is tracked iff it is in the commissioning/
/// cert-exchange phase."). Safe for concurrent add/remove/close (spec
/// §4.4).
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<Mutex<HashMap<u64, Entry>>>,
    next_id: Arc<Mutex<u64>>,
    notify: Arc<Notify>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Registers a connection on accept, returning a handle to remove it
    /// later (spec §4.4: "registered on accept").
    pub fn add(&self, conn: Arc<dyn Closeable>) -> u64 {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.inner.lock().insert(id, Entry { conn, added_at: Instant::now() });
        id
    }

    /// Removes a connection once it graduates to an operational zone
    /// session, or when it's closed for any other reason. Idempotent:
    /// double-remove is a no-op (spec §4.4).
    pub fn remove(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and removes every connection older than `max_age`. Returns the
    /// number reaped.
    fn reap_once(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut stale_ids = Vec::new();
        {
            let guard = self.inner.lock();
            for (id, entry) in guard.iter() {
                if now.saturating_duration_since(entry.added_at) >= max_age {
                    stale_ids.push(*id);
                }
            }
        }

        let mut reaped = 0;
        for id in stale_ids {
            let conn = { self.inner.lock().remove(&id).map(|e| e.conn) };
            if let Some(conn) = conn {
                conn.close();
                reaped += 1;
            }
        }
        reaped
    }

    /// Spawns the periodic reaper task. A crashed tick never terminates the
    /// service (spec §4.10) — only cancelling `shutdown` does.
    pub fn spawn_reaper(
        &self,
        reaper_interval: Duration,
        stale_connection_timeout: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reaper_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "mash::tracker", "reaper stopping on shutdown");
                        return;
                    }
                    _ = ticker.tick() => {
                        let reaped = tracker.reap_once(stale_connection_timeout);
                        if reaped > 0 {
                            debug!(target: "mash::tracker", reaped, "reaped stale pre-operational connections");
                        }
                    }
                }
            }
        })
    }

    /// Used by tests to wait for the tracker to settle after an async close.
    pub fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeConn(Arc<AtomicBool>);
    impl Closeable for FakeConn {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn add_remove_is_idempotent() {
        let tracker = ConnectionTracker::new();
        let closed = Arc::new(AtomicBool::new(false));
        let id = tracker.add(Arc::new(FakeConn(closed.clone())));
        assert_eq!(tracker.len(), 1);
        tracker.remove(id);
        assert_eq!(tracker.len(), 0);
        tracker.remove(id); // no-op, must not panic
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn reaper_closes_stale_connections() {
        let tracker = ConnectionTracker::new();
        let closed = Arc::new(AtomicBool::new(false));
        tracker.add(Arc::new(FakeConn(closed.clone())));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = tracker.reap_once(Duration::from_millis(10));
        assert_eq!(reaped, 1);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn reaper_leaves_fresh_connections_alone() {
        let tracker = ConnectionTracker::new();
        let closed = Arc::new(AtomicBool::new(false));
        tracker.add(Arc::new(FakeConn(closed.clone())));

        let reaped = tracker.reap_once(Duration::from_secs(30));
        assert_eq!(reaped, 0);
        assert!(!closed.load(Ordering::SeqCst));
        assert_eq!(tracker.len(), 1);
    }
}
