//! Process-wide shared state handed to every dispatcher: one owner value
//! holding the registry, persistence backend and filters behind internal
//! locks, rather than true globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::filter::Filter;
use crate::persistence::Persistence;
use crate::registry::ClientRegistry;

/// A one-shot, idempotent "please stop" latch.
///
/// Used to tell the listener's accept loop to stop, from either an explicit
/// `SHUTDOWN` command or the automatic empty-registry trigger. Triggering it
/// twice concurrently is safe.
#[derive(Default)]
pub struct ShutdownLatch {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownLatch {
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        // Register before checking: `trigger`'s `notify_waiters` drops a
        // wakeup for any waiter not yet registered, so checking the flag
        // first and awaiting second can miss a concurrent trigger.
        let notified = self.notify.notified();
        if self.triggered.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

/// Everything a dispatcher needs to serve one connection.
pub struct AppState {
    pub registry: ClientRegistry,
    pub persistence: Arc<dyn Persistence>,
    pub parallel_filters: Vec<Arc<dyn Filter>>,
    pub sequential_filters: Vec<Arc<dyn Filter>>,
    /// Serializes `select_resource` + mark-`INPROGRESS` so two clients never
    /// get handed the same resource.
    pub selection_lock: Mutex<()>,
    pub listener_stop: ShutdownLatch,
}

impl AppState {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        parallel_filters: Vec<Arc<dyn Filter>>,
        sequential_filters: Vec<Arc<dyn Filter>>,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(),
            persistence,
            parallel_filters,
            sequential_filters,
            selection_lock: Mutex::new(()),
            listener_stop: ShutdownLatch::default(),
        }
    }
}
