use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide readiness, flipped once the workload controllers are running.
#[derive(Debug, Default)]
pub struct ControllerState {
    ready: AtomicBool,
}

impl ControllerState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}
