//! Server-side bookkeeping of open scanners.
//!
//! Each tablet server keeps one registry. Entries are created when a scan
//! has rows left after its first batch, touched on every continuation, and
//! removed either when the scan drains, when a close request is processed,
//! or when the idle sweeper finds them untouched for longer than the TTL.
//!
//! Close requests are queued and applied by a background task, so callers
//! that need to observe the removal must poll [`ScannerRegistry::count_active_scanners`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::rpc::{ScannerId, TabletId};

struct ScannerEntry<S> {
    tablet_id: TabletId,
    last_touch: Instant,
    state: S,
}

struct RegistryShared<S> {
    entries: Mutex<HashMap<ScannerId, ScannerEntry<S>>>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl<S> RegistryShared<S> {
    fn entries(&self) -> MutexGuard<'_, HashMap<ScannerId, ScannerEntry<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: ScannerId) -> Option<S> {
        self.entries().remove(&id).map(|entry| entry.state)
    }

    fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|id, entry| {
            let idle = now.saturating_duration_since(entry.last_touch);
            let keep = idle <= self.ttl;
            if !keep {
                tracing::info!(
                    scanner_id = %id,
                    tablet_id = %entry.tablet_id,
                    idle_ms = idle.as_millis() as u64,
                    "expiring idle scanner"
                );
            }
            keep
        });
        before - entries.len()
    }
}

/// Active scanners of one tablet server, generic over the cursor state.
pub struct ScannerRegistry<S> {
    shared: Arc<RegistryShared<S>>,
    close_tx: mpsc::UnboundedSender<ScannerId>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: Send + 'static> ScannerRegistry<S> {
    /// Start a registry with its close processor and idle sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        let shared = Arc::new(RegistryShared {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ttl,
        });
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            spawn_close_processor(Arc::downgrade(&shared), close_rx),
            spawn_sweeper(Arc::downgrade(&shared), sweep_interval),
        ];
        Self {
            shared,
            close_tx,
            tasks,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    pub fn register(&self, tablet_id: TabletId, state: S) -> ScannerId {
        let id = ScannerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.entries().insert(
            id,
            ScannerEntry {
                tablet_id,
                last_touch: Instant::now(),
                state,
            },
        );
        id
    }

    /// Run `f` on the scanner's state, refreshing its last-touch time.
    /// `None` if the scanner is unknown or already expired.
    pub fn with_scanner<R>(&self, id: ScannerId, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let mut entries = self.shared.entries();
        let entry = entries.get_mut(&id)?;
        entry.last_touch = Instant::now();
        Some(f(&mut entry.state))
    }

    pub fn unregister(&self, id: ScannerId) -> Option<S> {
        self.shared.remove(id)
    }

    /// Queue `id` for removal. Returns before the entry is gone.
    pub fn request_close(&self, id: ScannerId) {
        if self.close_tx.send(id).is_err() {
            self.shared.remove(id);
        }
    }

    pub fn count_active_scanners(&self) -> usize {
        self.shared.entries().len()
    }

    /// Drop scanners idle for longer than the TTL as of `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.shared.sweep_expired(now)
    }

    /// Drop every entry, e.g. when the owning server goes down.
    pub fn clear(&self) {
        self.shared.entries().clear();
    }
}

impl<S> Drop for ScannerRegistry<S> {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn spawn_close_processor<S: Send + 'static>(
    registry: Weak<RegistryShared<S>>,
    mut close_rx: mpsc::UnboundedReceiver<ScannerId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(id) = close_rx.recv().await {
            let Some(shared) = registry.upgrade() else {
                break;
            };
            if shared.remove(id).is_some() {
                tracing::debug!(scanner_id = %id, "closed scanner");
            }
        }
    })
}

fn spawn_sweeper<S: Send + 'static>(
    registry: Weak<RegistryShared<S>>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = registry.upgrade() else {
                break;
            };
            shared.sweep_expired(Instant::now());
        }
    })
}
