use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatch/drop counters for one [`crate::ChannelDispatcher`].
///
/// A drop here means a channel's inbox was full when the connection manager
/// tried to hand it an accept or connect event — the event is discarded, not
/// retried, so the counter is the only record that it happened.
#[derive(Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "dispatched={} dropped={}",
            self.dispatched(),
            self.dropped()
        )
    }
}
