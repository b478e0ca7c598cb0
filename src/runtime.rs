use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_RUNTIMES: AtomicUsize = AtomicUsize::new(0);

/// Scoped replacement for a process-global init/shutdown pair: construct
/// one before using the library, drop it after every channel, server, and
/// completion queue is gone. Handles may be nested; the count is only
/// observability, nothing is torn down behind live objects' backs.
#[derive(Debug)]
pub struct Runtime {
    _private: (),
}

impl Runtime {
    #[must_use]
    pub fn init() -> Self {
        let live = LIVE_RUNTIMES.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("runtime up ({} live)", live);
        Self { _private: () }
    }

    #[must_use]
    pub fn live_count() -> usize {
        LIVE_RUNTIMES.load(Ordering::SeqCst)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let live = LIVE_RUNTIMES.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!("runtime down ({} live)", live);
    }
}
