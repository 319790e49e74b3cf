//! Write-failure subscriber registry: a lock-guarded list of callbacks
//! invoked synchronously on the calling thread, ignoring their return value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::key::Key;
use crate::metrics::{MetricsCollector, NoopMetrics};

pub type WriteFailureHandler = Box<dyn Fn(&Key) + Send + Sync>;

/// Tracks subscribers to be notified when a write (`ms`/`md`, or a
/// TTL-mutating `mg`) fails against a server.
pub struct WriteFailureTracker {
    handlers: Mutex<Vec<WriteFailureHandler>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Default for WriteFailureTracker {
    fn default() -> Self {
        WriteFailureTracker {
            handlers: Mutex::new(Vec::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl WriteFailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_metrics(metrics: Arc<dyn MetricsCollector>) -> Self {
        WriteFailureTracker {
            handlers: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub fn subscribe(&self, handler: WriteFailureHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Invokes every subscriber with `key`, synchronously, on this thread.
    pub fn notify(&self, key: &Key) {
        self.metrics.increment_counter("write_failure", 1, &HashMap::new());
        for handler in self.handlers.lock().unwrap().iter() {
            handler(key);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn notifies_every_subscriber_synchronously() {
        let tracker = WriteFailureTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            tracker.subscribe(Box::new(move |_key| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        tracker.notify(&Key::new("foo").unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn no_subscribers_is_a_no_op() {
        let tracker = WriteFailureTracker::new();
        tracker.notify(&Key::new("foo").unwrap());
        assert_eq!(tracker.subscriber_count(), 0);
    }
}
