//! Idle and lifetime timeout supervision.
//!
//! One watchdog thread scans a slot arena of weak connection references and
//! posts timeout tasks to the owning dispatchers; the dispatcher fires the
//! handler callback and closes the connection unless the handler claims the
//! event. Slots are addressed by `(index, generation)` keys, so a stale key
//! from an already-closed connection can never touch a reused slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::connection::{now_ms, ConnShared};
use crate::dispatcher::{DispatcherHandle, Task};

const MIN_SCAN_MS: u64 = 10;
const MAX_SCAN_MS: u64 = 1000;

/// Stable reference to one registry slot. Valid only while the generation
/// matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutKey {
    idx: usize,
    generation: u64,
}

struct Entry {
    shared: Weak<ConnShared>,
    dispatcher: DispatcherHandle,
}

struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// Shared between dispatchers (register/deregister) and the watchdog
/// thread (scan).
pub(crate) struct TimeoutRegistry {
    slots: Mutex<Slots>,
    /// Scan period in milliseconds. Only ever narrowed while running, so a
    /// short timeout registered later cannot be missed by a wide scan.
    scan_interval_ms: AtomicU64,
    shutdown: AtomicBool,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        TimeoutRegistry {
            slots: Mutex::new(Slots::default()),
            scan_interval_ms: AtomicU64::new(MAX_SCAN_MS),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        match self.slots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Track a connection. Narrows the scan period to half the smallest
    /// timeout the connection carries.
    pub fn register(&self, shared: &Arc<ConnShared>, dispatcher: DispatcherHandle) -> TimeoutKey {
        for timeout in [
            shared.idle_timeout_ms.load(Ordering::Relaxed),
            shared.conn_timeout_ms.load(Ordering::Relaxed),
        ] {
            if timeout > 0 {
                let want = (timeout / 2).clamp(MIN_SCAN_MS, MAX_SCAN_MS);
                self.scan_interval_ms.fetch_min(want, Ordering::Relaxed);
            }
        }
        let entry = Entry {
            shared: Arc::downgrade(shared),
            dispatcher,
        };
        let mut slots = self.lock();
        if let Some(idx) = slots.free.pop() {
            let slot = &mut slots.slots[idx];
            slot.generation += 1;
            slot.entry = Some(entry);
            TimeoutKey {
                idx,
                generation: slot.generation,
            }
        } else {
            slots.slots.push(Slot {
                generation: 1,
                entry: Some(entry),
            });
            TimeoutKey {
                idx: slots.slots.len() - 1,
                generation: 1,
            }
        }
    }

    /// Release a slot. A stale key (generation mismatch) is ignored.
    pub fn deregister(&self, key: TimeoutKey) {
        let mut slots = self.lock();
        let Some(slot) = slots.slots.get_mut(key.idx) else {
            return;
        };
        if slot.generation != key.generation || slot.entry.is_none() {
            return;
        }
        slot.entry = None;
        slots.free.push(key.idx);
    }

    /// One scan pass: fire due timeouts, prune dead entries. The slots
    /// mutex is held only to snapshot live connections; deadline checks
    /// and task posts happen after it is released, so a dispatcher
    /// registering or deregistering never waits on a channel send.
    fn scan(&self) {
        let mut live: Vec<(Arc<ConnShared>, DispatcherHandle)> = Vec::new();
        {
            let mut slots = self.lock();
            let mut freed = Vec::new();
            for (idx, slot) in slots.slots.iter_mut().enumerate() {
                let Some(entry) = slot.entry.as_ref() else {
                    continue;
                };
                let Some(shared) = entry.shared.upgrade() else {
                    slot.entry = None;
                    freed.push(idx);
                    continue;
                };
                live.push((shared, entry.dispatcher.clone()));
            }
            slots.free.extend(freed);
        }

        let now = now_ms();
        for (shared, dispatcher) in live {
            if !shared.is_open() {
                continue;
            }
            let idle_ms = shared.idle_timeout_ms.load(Ordering::Relaxed);
            if idle_ms > 0
                && shared.idle_for_ms(now) >= idle_ms
                && !shared.idle_fired.swap(true, Ordering::Relaxed)
            {
                trace!(conn = %shared.id, idle_ms, "idle timeout due");
                let _ = dispatcher.send_task(Task::IdleTimeout { conn: shared.id });
            }
            let life_ms = shared.conn_timeout_ms.load(Ordering::Relaxed);
            if life_ms > 0
                && shared.age_ms(now) >= life_ms
                && !shared.lifetime_fired.swap(true, Ordering::Relaxed)
            {
                trace!(conn = %shared.id, life_ms, "connection timeout due");
                let _ = dispatcher.send_task(Task::ConnectionTimeout { conn: shared.id });
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Run the watchdog on its own thread until shutdown.
    pub fn spawn_watchdog(self: &Arc<Self>) -> std::io::Result<std::thread::JoinHandle<()>> {
        let registry = Arc::clone(self);
        std::thread::Builder::new()
            .name("wireline-timeout".to_string())
            .spawn(move || {
                debug!("timeout watchdog started");
                while !registry.shutdown.load(Ordering::Acquire) {
                    registry.scan();
                    let interval = registry.scan_interval_ms.load(Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(interval.min(MAX_SCAN_MS)));
                }
                debug!("timeout watchdog stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{detached_handle, rendezvous_handle};
    use std::net::SocketAddr;
    use std::time::Instant;

    fn shared_with(idle: Option<Duration>, life: Option<Duration>) -> Arc<ConnShared> {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Arc::new(ConnShared::new(addr, addr, idle, life))
    }

    #[test]
    fn stale_key_cannot_free_a_reused_slot() {
        let registry = TimeoutRegistry::new();
        let (handle, _rx) = detached_handle();
        let first = shared_with(None, None);
        let key = registry.register(&first, handle.clone());
        registry.deregister(key);
        let second = shared_with(None, None);
        let key2 = registry.register(&second, handle);
        assert_eq!(key.idx, key2.idx);
        // The old key is one generation behind and must be a no-op.
        registry.deregister(key);
        let slots = registry.lock();
        assert!(slots.slots[key2.idx].entry.is_some());
    }

    #[test]
    fn scan_prunes_dropped_connections() {
        let registry = TimeoutRegistry::new();
        let (handle, _rx) = detached_handle();
        let shared = shared_with(Some(Duration::from_millis(5)), None);
        registry.register(&shared, handle);
        drop(shared);
        registry.scan();
        let slots = registry.lock();
        assert!(slots.slots[0].entry.is_none());
        assert_eq!(slots.free, vec![0]);
    }

    #[test]
    fn idle_timeout_posts_task_once_until_rearmed() {
        let registry = TimeoutRegistry::new();
        let (handle, rx) = detached_handle();
        let shared = shared_with(Some(Duration::from_millis(1)), None);
        registry.register(&shared, handle);
        std::thread::sleep(Duration::from_millis(5));
        registry.scan();
        registry.scan();
        let fired: Vec<Task> = rx.try_iter().collect();
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], Task::IdleTimeout { conn } if conn == shared.id));
        // Activity re-arms; the next scan fires again.
        shared.touch();
        std::thread::sleep(Duration::from_millis(5));
        registry.scan();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn scan_posts_without_blocking_registrations() {
        let registry = Arc::new(TimeoutRegistry::new());
        let (handle, rx) = rendezvous_handle();
        let shared = shared_with(Some(Duration::from_millis(1)), None);
        registry.register(&shared, handle.clone());
        std::thread::sleep(Duration::from_millis(5));

        // The scanner parks in the task send until we receive below; a
        // registration from this thread must still get through first.
        let scan_registry = Arc::clone(&registry);
        let scanner = std::thread::spawn(move || scan_registry.scan());
        std::thread::sleep(Duration::from_millis(20));

        let other = shared_with(None, None);
        let start = Instant::now();
        registry.register(&other, handle);
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "registration stalled behind an in-flight scan"
        );

        let task = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(task, Task::IdleTimeout { conn } if conn == shared.id));
        scanner.join().unwrap();
    }

    #[test]
    fn register_narrows_scan_interval() {
        let registry = TimeoutRegistry::new();
        let (handle, _rx) = detached_handle();
        let shared = shared_with(Some(Duration::from_millis(100)), None);
        registry.register(&shared, handle);
        assert_eq!(registry.scan_interval_ms.load(Ordering::Relaxed), 50);
    }
}
