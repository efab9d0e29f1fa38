//! WireGuard tunnel machinery
//!
//! Everything between "the daemon asked for a tunnel" and "packets flow":
//!
//! - params.rs: immutable connection parameters and key handling
//! - device.rs: tunnel device controller (interface allocation, peer
//!   configuration, userspace WireGuard process management)
//! - handshake.rs: first-handshake polling against the control plane
//! - routes.rs: routing-table mutations and the default-route watcher
//! - lifecycle.rs: the connect/pause/resume/disconnect state machine

pub mod device;
pub mod handshake;
pub mod lifecycle;
pub mod params;
pub mod routes;

/// Tunnel engine errors.
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    /// Bad credentials, missing local IP, unsupported DNS encryption.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Interface, port or tool could not be acquired.
    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A system tool or the OS bridge failed.
    #[error("{0}")]
    Os(String),

    /// Operation aborted by a disconnect/stop request. Not a failure.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection returned because of a pause/resume cycle; the owner
    /// is expected to run the whole connect sequence again.
    #[error("reconnection required")]
    ReconnectionRequired,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VpnResult<T> = Result<T, VpnError>;

/// Connection state as published to the daemon (and from there to the UI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Reconnecting,
    Connected,
    Disconnected,
    Paused,
}

/// A state transition event.
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub state: State,
    pub message: Option<String>,
}

impl StateInfo {
    pub fn new(state: State) -> Self {
        StateInfo { state, message: None }
    }

    pub fn with_message(state: State, message: impl Into<String>) -> Self {
        StateInfo {
            state,
            message: Some(message.into()),
        }
    }
}

/// LIFO stack of cleanup actions.
///
/// Each privileged mutation registers its inverse here before the next
/// mutation begins, so any exit path (error, cancel, panic) unwinds the
/// acquired resources in reverse order. A failing cleanup is logged and
/// never stops the remaining ones.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: &'static str, action: impl FnOnce() + Send + 'static) {
        self.actions.push((label, Box::new(action)));
    }

    /// Run all registered actions, most recent first.
    pub fn unwind(&mut self) {
        while let Some((label, action)) = self.actions.pop() {
            log::debug!("cleanup: {}", label);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
                log::error!("cleanup '{}' panicked, continuing", label);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cleanup_unwinds_in_reverse_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push("step", move || order.lock().push(i));
        }
        stack.unwind();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn cleanup_runs_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut stack = CleanupStack::new();
            let count = count.clone();
            stack.push("drop", move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_continues_past_panicking_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut stack = CleanupStack::new();
        {
            let count = count.clone();
            stack.push("first", move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        stack.push("panics", || panic!("boom"));
        stack.unwind();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
