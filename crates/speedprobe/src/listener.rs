/// Listener traits and the registry shared by the client and its task.
///
/// Dispatch clones the current list under a read lock and calls out with no
/// lock held, so a listener may add or remove listeners from inside a
/// callback.

use std::sync::Arc;

use parking_lot::RwLock;
use speedprobe_types::{SpeedTestError, SpeedTestReport};

/// Receives events for single download/upload operations.
pub trait SpeedTestListener: Send + Sync {
    fn on_completion(&self, report: &SpeedTestReport);

    fn on_progress(&self, _percent: f32, _report: &SpeedTestReport) {}

    fn on_error(&self, error: SpeedTestError, message: &str);
}

/// Receives aggregated events for a repeat window.
pub trait RepeatListener: Send + Sync {
    /// Window expired; `report` is the final aggregate.
    fn on_completion(&self, report: &SpeedTestReport);

    /// Periodic aggregate while the window is open.
    fn on_report(&self, report: &SpeedTestReport);
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn SpeedTestListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn SpeedTestListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes every registration of this exact listener instance.
    pub fn remove(&self, listener: &Arc<dyn SpeedTestListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn SpeedTestListener>> {
        self.listeners.read().clone()
    }

    pub fn dispatch_completion(&self, report: &SpeedTestReport) {
        for listener in self.snapshot() {
            listener.on_completion(report);
        }
    }

    pub fn dispatch_progress(&self, percent: f32, report: &SpeedTestReport) {
        for listener in self.snapshot() {
            listener.on_progress(percent, report);
        }
    }

    pub fn dispatch_error(&self, error: SpeedTestError, message: &str) {
        for listener in self.snapshot() {
            listener.on_error(error, message);
        }
    }
}
