//! The client registry and the ID allocator.
//!
//! Two process-wide tables keyed by client-id: the info table (the client
//! record) and the control table (worker liveness + stop signal). Both
//! tables live behind one `tokio::sync::RwLock` so that the status/admin
//! paths can take a consistent snapshot without blocking per-connection
//! mutations for longer than one lock acquisition.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

pub type ClientId = u64;

/// One-shot cancellation flag observed at the next `GET_ID` checkpoint.
#[derive(Debug, Default)]
pub struct StopSignal(AtomicBool);

impl StopSignal {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Tracks whether the worker handling a client is still running, without
/// needing to recover a `JoinHandle` from inside the task it identifies.
/// `RM_CLIENT`/`SHUTDOWN` await [`AliveFlag::wait_until_dead`] instead of
/// spinning on a liveness poll.
#[derive(Debug, Default)]
pub struct AliveFlag {
    alive: AtomicBool,
    notify: Notify,
}

impl AliveFlag {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub async fn wait_until_dead(&self) {
        // Register the `Notified` future before checking the flag: `mark_dead`
        // calls `notify_waiters`, which drops a wakeup for any waiter not yet
        // registered, so checking first and awaiting second can miss it.
        let notified = self.notify.notified();
        if !self.is_alive() {
            return;
        }
        notified.await;
    }
}

/// RAII guard installed by a dispatcher task for the duration of one
/// connection; marks the client's [`AliveFlag`] dead on every exit path,
/// including panics, mirroring `DbDropGuard`'s drop-triggered cleanup.
pub struct LivenessGuard(Arc<AliveFlag>);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.mark_dead();
    }
}

/// The client record.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub addr: SocketAddr,
    pub pid: i64,
    pub current_resource_id: Option<String>,
    pub collected_count: u64,
    pub start_time: DateTime<Local>,
    pub last_update_time: DateTime<Local>,
}

impl ClientInfo {
    pub fn new(name: String, addr: SocketAddr, pid: i64) -> Self {
        let now = Local::now();
        Self {
            name,
            addr,
            pid,
            current_resource_id: None,
            collected_count: 0,
            start_time: now,
            last_update_time: now,
        }
    }
}

struct ControlEntry {
    stop: Arc<StopSignal>,
    alive: Arc<AliveFlag>,
}

#[derive(Default)]
struct RegistryState {
    info: HashMap<ClientId, ClientInfo>,
    control: HashMap<ClientId, ControlEntry>,
}

/// Monotonic client-id allocator. `fetch_add` serializes allocation without
/// ever reusing a value within the process lifetime.
#[derive(Debug, Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn allocate(&self) -> ClientId {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Process-wide client registry.
#[derive(Default)]
pub struct ClientRegistry {
    state: RwLock<RegistryState>,
    ids: IdAllocator,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            ids: IdAllocator::new(),
        }
    }

    pub fn allocate_id(&self) -> ClientId {
        self.ids.allocate()
    }

    /// Install a freshly logged-in client in both tables. Returns the stop
    /// signal the dispatcher must check at `GET_ID` and a [`LivenessGuard`]
    /// the dispatcher must hold for the lifetime of the connection.
    pub async fn insert(&self, id: ClientId, info: ClientInfo) -> (Arc<StopSignal>, LivenessGuard) {
        let stop = Arc::new(StopSignal::default());
        let alive = Arc::new(AliveFlag::new());
        let mut state = self.state.write().await;
        state.info.insert(id, info);
        state.control.insert(
            id,
            ControlEntry {
                stop: Arc::clone(&stop),
                alive: Arc::clone(&alive),
            },
        );
        (stop, LivenessGuard(alive))
    }

    pub async fn set_current_resource(&self, id: ClientId, resource: Option<String>) {
        let mut state = self.state.write().await;
        if let Some(info) = state.info.get_mut(&id) {
            info.current_resource_id = resource;
            info.last_update_time = Local::now();
        }
    }

    pub async fn increment_collected(&self, id: ClientId) {
        let mut state = self.state.write().await;
        if let Some(info) = state.info.get_mut(&id) {
            info.collected_count += 1;
        }
    }

    /// Remove the info entry for `id`. Returns `true` if the info table is
    /// now empty, which triggers automatic shutdown.
    pub async fn remove_info(&self, id: ClientId) -> bool {
        let mut state = self.state.write().await;
        state.info.remove(&id);
        state.info.is_empty()
    }

    pub async fn info_is_empty(&self) -> bool {
        self.state.read().await.info.is_empty()
    }

    pub async fn info_snapshot(&self, id: ClientId) -> Option<ClientInfo> {
        self.state.read().await.info.get(&id).cloned()
    }

    /// Snapshot of every connected client for the status report and for
    /// shutdown iteration: `(id, info, worker_alive)`.
    pub async fn snapshot(&self) -> Vec<(ClientId, ClientInfo, bool)> {
        let state = self.state.read().await;
        state
            .info
            .iter()
            .map(|(id, info)| {
                let alive = state
                    .control
                    .get(id)
                    .map(|entry| entry.alive.is_alive())
                    .unwrap_or(false);
                (*id, info.clone(), alive)
            })
            .collect()
    }

    pub async fn control_ids(&self) -> Vec<ClientId> {
        self.state.read().await.control.keys().copied().collect()
    }

    pub async fn contains_control(&self, id: ClientId) -> bool {
        self.state.read().await.control.contains_key(&id)
    }

    pub async fn stop_signal(&self, id: ClientId) -> Option<Arc<StopSignal>> {
        self.state.read().await.control.get(&id).map(|e| Arc::clone(&e.stop))
    }

    /// `true` while the worker handling `id` has not yet returned.
    pub async fn is_alive(&self, id: ClientId) -> bool {
        self.state
            .read()
            .await
            .control
            .get(&id)
            .map(|entry| entry.alive.is_alive())
            .unwrap_or(false)
    }

    /// Request the stop signal for `id`, returning `false` if unknown.
    pub async fn request_stop(&self, id: ClientId) -> bool {
        let state = self.state.read().await;
        match state.control.get(&id) {
            Some(entry) => {
                entry.stop.set();
                true
            }
            None => false,
        }
    }

    /// Wait until the worker handling `id` has exited, without holding the
    /// registry lock across the wait.
    pub async fn wait_until_dead(&self, id: ClientId) {
        let alive = {
            let state = self.state.read().await;
            state.control.get(&id).map(|e| Arc::clone(&e.alive))
        };
        if let Some(alive) = alive {
            alive.wait_until_dead().await;
        }
    }

    /// Remove both tables' entries for `id`, once the target has been
    /// drained (`RM_CLIENT`/`SHUTDOWN`).
    pub async fn remove(&self, id: ClientId) {
        let mut state = self.state.write().await;
        state.info.remove(&id);
        state.control.remove(&id);
    }

    pub async fn control_is_empty(&self) -> bool {
        self.state.read().await.control.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let registry = ClientRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let c = registry.allocate_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn registry_becomes_empty_after_last_info_removed() {
        let registry = ClientRegistry::new();
        let id = registry.allocate_id();
        let (_stop, _guard) = registry.insert(id, ClientInfo::new("w".into(), addr(), 1)).await;
        assert!(!registry.info_is_empty().await);
        let now_empty = registry.remove_info(id).await;
        assert!(now_empty);
    }

    #[tokio::test]
    async fn stop_signal_is_observed_by_clone() {
        let registry = ClientRegistry::new();
        let id = registry.allocate_id();
        let (stop, _guard) = registry.insert(id, ClientInfo::new("w".into(), addr(), 1)).await;
        assert!(!stop.is_set());
        assert!(registry.request_stop(id).await);
        assert!(stop.is_set());
    }

    #[tokio::test]
    async fn dropping_the_liveness_guard_marks_the_client_dead() {
        let registry = ClientRegistry::new();
        let id = registry.allocate_id();
        let (_stop, guard) = registry.insert(id, ClientInfo::new("w".into(), addr(), 1)).await;
        assert!(registry.is_alive(id).await);
        drop(guard);
        assert!(!registry.is_alive(id).await);
    }

    #[tokio::test]
    async fn wait_until_dead_resolves_once_guard_drops() {
        let registry = Arc::new(ClientRegistry::new());
        let id = registry.allocate_id();
        let (_stop, guard) = registry.insert(id, ClientInfo::new("w".into(), addr(), 1)).await;

        let waiter_registry = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            waiter_registry.wait_until_dead(id).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_until_dead should resolve promptly")
            .unwrap();
    }
}
