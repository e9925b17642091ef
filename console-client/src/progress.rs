//! Global loading indicator shared by every request a gateway issues.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts requests currently in progress. Clone is a cheap Arc refcount bump.
#[derive(Clone, Default)]
pub struct LoadingIndicator {
    active: Arc<AtomicUsize>,
}

/// Decrements the indicator when dropped, whatever way the request ended.
pub struct LoadingGuard {
    active: Arc<AtomicUsize>,
}

impl LoadingIndicator {
    pub fn start(&self) -> LoadingGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        LoadingGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.active() > 0
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
