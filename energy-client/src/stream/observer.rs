use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use crate::domain::ReadingBatch;

use super::ClientFatalError;

/// Local consumer of a `StreamClient`.
///
/// Callbacks run synchronously on the client's task and should return quickly.
pub trait StreamObserver: Send + Sync {
    fn on_readings(&self, batch: &ReadingBatch);

    /// Called once when the client gives up reconnecting.
    fn on_fatal(&self, _error: &ClientFatalError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub(crate) struct ObserverSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ObserverId, Arc<dyn StreamObserver>)>>,
}

impl ObserverSet {
    pub(crate) fn add(&self, observer: Arc<dyn StreamObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn StreamObserver>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// A panicking observer is logged and skipped; the rest still run.
    pub(crate) fn notify_readings(&self, batch: &ReadingBatch) {
        for observer in self.snapshot() {
            isolate("on_readings", || observer.on_readings(batch));
        }
    }

    pub(crate) fn notify_fatal(&self, error: &ClientFatalError) {
        for observer in self.snapshot() {
            isolate("on_fatal", || observer.on_fatal(error));
        }
    }
}

fn isolate(callback: &'static str, f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(callback, panic = %message, "stream observer panicked");
    }
}
