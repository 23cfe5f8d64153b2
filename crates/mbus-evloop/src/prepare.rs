//! Prepare hooks, run at the start of every cycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::mgr::MgrInner;

pub(crate) type PrepareHandler = Box<dyn FnMut() + Send>;

pub(crate) struct PrepareEntry {
    pub refs: AtomicUsize,
    pub deleted: AtomicBool,
    pub handler: Mutex<PrepareHandler>,
    pub mgr: Weak<MgrInner>,
}

/// Handle on a registered prepare hook; dropping every handle removes it.
pub struct EvPrepare {
    entry: Arc<PrepareEntry>,
}

impl EvPrepare {
    pub(crate) fn from_entry(entry: Arc<PrepareEntry>) -> Self {
        EvPrepare { entry }
    }
}

impl Clone for EvPrepare {
    fn clone(&self) -> Self {
        self.entry.refs.fetch_add(1, Ordering::Relaxed);
        EvPrepare {
            entry: self.entry.clone(),
        }
    }
}

impl Drop for EvPrepare {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.deleted.store(true, Ordering::Release);
            if let Some(mgr) = self.entry.mgr.upgrade() {
                mgr.preparers_cleanup.store(true, Ordering::Release);
            }
        }
    }
}
