//! Cooperative shutdown and worker-state diagnostics.
//!
//! One process-wide stop flag, set exactly once by the first stop signal;
//! later signals are no-ops so teardown never re-enters. Worker loops check
//! the flag at every loop head and before every blocking wait. The state
//! dump is an independent diagnostic that never alters the stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::info;

/// Process-wide stop flag plus a wakeup for slots parked in idle backoff.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    stop_requested: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request shutdown. Only the first call has any effect.
    pub fn request(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early (true) if shutdown is
    /// requested before it elapses. Bounded shutdown latency for idle
    /// slots: they never sleep through a stop signal.
    pub async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            () = self.notify.notified() => {}
            () = tokio::time::sleep(duration) => {}
        }
        self.is_requested()
    }
}

/// What one worker slot is doing right now, published for the state dump.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub worker_id: String,
    pub activity: String,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Shared board of live slot states, dumpable on demand (SIGQUIT).
#[derive(Debug, Default)]
pub struct StateBoard {
    slots: DashMap<usize, SlotState>,
    dumping: AtomicBool,
}

impl StateBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, slot: usize, worker_id: &str, activity: impl Into<String>) {
        self.slots.insert(
            slot,
            SlotState {
                worker_id: worker_id.to_string(),
                activity: activity.into(),
                since: chrono::Utc::now(),
            },
        );
    }

    pub fn clear(&self, slot: usize) {
        self.slots.remove(&slot);
    }

    /// Log the identity and state of every live slot.
    ///
    /// Disabled for its own duration: a dump triggered while one is already
    /// running is dropped, then the handler is re-armed.
    pub fn dump(&self) {
        if self.dumping.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut states: Vec<(usize, SlotState)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        states.sort_by_key(|(slot, _)| *slot);

        info!("dumping state of {} worker slot(s)", states.len());
        for (slot, state) in states {
            info!(
                slot,
                worker_id = %state.worker_id,
                activity = %state.activity,
                since = %state.since.to_rfc3339(),
                "slot state"
            );
        }
        self.dumping.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_request_wins_later_ones_noop() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_requested());
        coordinator.request();
        coordinator.request();
        assert!(coordinator.is_requested());
    }

    #[tokio::test]
    async fn sleep_returns_early_on_request() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.sleep_unless_stopped(Duration::from_secs(60)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.request();
        let stopped = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("sleep did not wake on shutdown")
            .expect("task panicked");
        assert!(stopped);
    }

    #[tokio::test]
    async fn sleep_elapses_when_no_request() {
        let coordinator = ShutdownCoordinator::new();
        let stopped = coordinator
            .sleep_unless_stopped(Duration::from_millis(10))
            .await;
        assert!(!stopped);
    }

    #[test]
    fn state_board_tracks_and_clears_slots() {
        let board = StateBoard::new();
        board.set(0, "worker-a", "browsing http://example.com/");
        board.set(1, "worker-a", "idle");
        assert_eq!(board.slots.len(), 2);
        board.dump();
        board.clear(0);
        assert_eq!(board.slots.len(), 1);
    }
}
