//! Event infrastructure for index-core.
//!
//! Provides `FolderEvent` for debug/monitoring and `EventBus` for
//! subscriptions. The bus is shared as `Arc<EventBus>` across the folder
//! tasks of a multi-threaded Tokio runtime.

use crate::DeviceId;
use crate::protocol::IndexKind;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted while folders are scanned and indexes propagated.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FolderEvent {
    /// Folder index loaded and reconciler running.
    FolderStarted {
        folder: String,
        /// Records restored from the index database.
        records: usize,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    FolderStopped {
        folder: String,
        timestamp: f64,
    },
    /// A new ignore rule set was installed.
    IgnoresChanged {
        folder: String,
        revision: u64,
        /// Number of rule lines, comments included.
        patterns: usize,
        timestamp: f64,
    },
    /// A scan pass finished.
    ScanCompleted {
        folder: String,
        scanned: usize,
        updated: usize,
        failed: usize,
        timestamp: f64,
    },
    /// A single file could not be read; it is now invalid.
    ScanItemFailed {
        folder: String,
        name: String,
        error: String,
        timestamp: f64,
    },
    /// Local index changed during a reconciliation pass.
    LocalIndexUpdated {
        folder: String,
        items: usize,
        filenames: Vec<String>,
        timestamp: f64,
    },
    /// An index message was handed to a peer connection.
    IndexSent {
        folder: String,
        device: DeviceId,
        kind: IndexKind,
        files: usize,
        timestamp: f64,
    },
    /// A distributor fell behind and restarted from a fresh snapshot.
    DistributorResync {
        folder: String,
        device: DeviceId,
        /// Changes dropped by the lagging subscription.
        skipped: u64,
        timestamp: f64,
    },
    DeviceConnected {
        device: DeviceId,
        timestamp: f64,
    },
    DeviceDisconnected {
        device: DeviceId,
        timestamp: f64,
    },
}

/// Current time in milliseconds since Unix epoch, as used in event timestamps.
pub fn now_millis() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(FolderEvent) + Send + Sync>;

/// Event bus for publishing folder events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(FolderEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: FolderEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
