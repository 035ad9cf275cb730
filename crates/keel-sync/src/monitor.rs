//! Connectivity monitor: a two-state machine with a debounced
//! reconnection signal.
//!
//! The host feeds transitions through [`NetworkMonitor::report`]; this is
//! the capability seam that replaces platform-specific polling. An
//! offline→online transition schedules exactly one subscriber
//! notification after a settle window; flapping inside the window
//! collapses into that single notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Online,
    Offline,
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct MonitorInner {
    state: Mutex<ConnState>,
    subscribers: Mutex<Vec<Callback>>,
    /// True while a settle timer is pending; collapses flapping.
    settling: AtomicBool,
    stopped: AtomicBool,
    settle_window: Duration,
}

/// Detects online/offline transitions and debounces reconnection signals.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Create a monitor starting in the given state.
    pub fn new(initial: ConnState, settle_window: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(initial),
                subscribers: Mutex::new(Vec::new()),
                settling: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                settle_window,
            }),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnState::Online
    }

    /// Register a callback fired after a settled reconnection. Callbacks
    /// must not block; they only enqueue work.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Feed a connectivity observation from the host environment.
    pub fn report(&self, observed: ConnState) {
        let transition_to_online = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let was = *state;
            *state = observed;
            was == ConnState::Offline && observed == ConnState::Online
        };
        if !transition_to_online || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        // One timer per settle window; repeated flapping collapses into
        // the already-scheduled notification.
        if self.inner.settling.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("monitor: reconnect observed, settling");
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            thread::sleep(inner.settle_window);
            inner.settling.store(false, Ordering::SeqCst);
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            // Skip the run if connectivity dropped again before settling.
            let online = *inner.state.lock().unwrap_or_else(|e| e.into_inner())
                == ConnState::Online;
            if !online {
                tracing::debug!("monitor: reconnect did not settle, skipping");
                return;
            }
            tracing::info!("monitor: connectivity settled, notifying subscribers");
            let subscribers = inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for callback in subscribers.iter() {
                callback();
            }
        });
    }

    /// Cancel pending notifications; subsequent transitions are ignored.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}
