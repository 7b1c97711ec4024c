use std::sync::atomic::{AtomicBool, Ordering};

/// Shared view of whether the underlying transport is currently alive. Collectors consult
///  this when a wait runs out of budget to distinguish a server that did not answer from a
///  stream that died underneath the waiter.
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
}

impl LinkStatus {
    pub fn new() -> LinkStatus {
        LinkStatus {
            connected: AtomicBool::new(false),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
