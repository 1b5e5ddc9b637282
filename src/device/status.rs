//! Idle/active status tracking across pipeline components
//!
//! The device derives CONFIGURED vs ACTIVE from this observer instead of
//! setting it synchronously: components (the request worker, the in-flight
//! map) report their own activity, and the device reacts to the aggregate
//! flipping.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{CameraError, Result};

pub(crate) type ComponentId = usize;

struct StatusInner {
    names: Vec<&'static str>,
    active: HashSet<ComponentId>,
}

pub(crate) struct StatusTracker {
    inner: Mutex<StatusInner>,
    cond: Condvar,
}

impl StatusTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                names: Vec::new(),
                active: HashSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn register_component(&self, name: &'static str) -> ComponentId {
        let mut inner = self.inner.lock().unwrap();
        inner.names.push(name);
        inner.names.len() - 1
    }

    /// Update one component's activity. Returns `Some(idle)` when the
    /// aggregate idle/active status changed as a result.
    pub(crate) fn set_active(&self, component: ComponentId, active: bool) -> Option<bool> {
        let mut inner = self.inner.lock().unwrap();
        let was_idle = inner.active.is_empty();
        if active {
            inner.active.insert(component);
        } else {
            inner.active.remove(&component);
        }
        let is_idle = inner.active.is_empty();
        trace!(
            component = inner.names.get(component).copied().unwrap_or("?"),
            active,
            is_idle,
            "component status update"
        );
        if is_idle != was_idle {
            self.cond.notify_all();
            Some(is_idle)
        } else {
            None
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.inner.lock().unwrap().active.is_empty()
    }

    /// Block until every component is idle.
    pub(crate) fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while !inner.active.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Timeout {
                    what: "pipeline idle",
                    after: timeout,
                });
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_flips_only_on_edges() {
        let tracker = StatusTracker::new();
        let a = tracker.register_component("a");
        let b = tracker.register_component("b");

        assert_eq!(tracker.set_active(a, true), Some(false));
        assert_eq!(tracker.set_active(b, true), None);
        assert_eq!(tracker.set_active(a, false), None);
        assert_eq!(tracker.set_active(b, false), Some(true));
        assert!(tracker.is_idle());
    }

    #[test]
    fn wait_until_idle_observes_release() {
        use std::sync::Arc;
        let tracker = Arc::new(StatusTracker::new());
        let c = tracker.register_component("worker");
        tracker.set_active(c, true);

        let t2 = Arc::clone(&tracker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            t2.set_active(c, false);
        });
        tracker.wait_until_idle(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
    }
}
