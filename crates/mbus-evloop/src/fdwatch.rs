//! File-descriptor event sources.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::mgr::MgrInner;
use crate::{EV_HUP, EV_IN, EV_OUT};

pub(crate) type FdHandler = Box<dyn FnMut(&EvFd, u32) + Send>;

pub(crate) struct FdState {
    pub events: u32,
    pub is_set: bool,
    pub has_changed: bool,
    pub deleted: bool,
}

pub(crate) struct FdEntry {
    pub token: mio::Token,
    pub fd: RawFd,
    pub auto_close: bool,
    pub auto_unref: bool,
    pub state: Mutex<FdState>,
    /// Count of live `EvFd` handles.
    pub refs: AtomicUsize,
    pub handler: Mutex<FdHandler>,
    pub mgr: Weak<MgrInner>,
}

impl FdEntry {
    pub(crate) fn discard(&self) {
        self.state.lock().unwrap().deleted = true;
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.fds_cleanup.store(true, Ordering::Release);
        }
    }
}

/// Handle on a watched file descriptor. Clones share the source; the
/// source is discarded at the next prepare once every handle is dropped
/// (closing the fd too when registered with `auto_close`).
pub struct EvFd {
    entry: Arc<FdEntry>,
}

impl EvFd {
    pub(crate) fn from_entry(entry: Arc<FdEntry>) -> Self {
        EvFd { entry }
    }

    fn new_ref(entry: &Arc<FdEntry>) -> Self {
        entry.refs.fetch_add(1, Ordering::Relaxed);
        EvFd {
            entry: entry.clone(),
        }
    }

    /// The watched descriptor.
    pub fn fd(&self) -> RawFd {
        self.entry.fd
    }

    /// Currently requested readiness mask.
    pub fn events(&self) -> u32 {
        self.entry.state.lock().unwrap().events
    }

    /// Change the requested readiness mask; applied at the next prepare.
    pub fn set_events(&self, events: u32) {
        let mut st = self.entry.state.lock().unwrap();
        if st.events != events {
            st.events = events;
            st.has_changed = true;
            drop(st);
            if let Some(mgr) = self.entry.mgr.upgrade() {
                mgr.fds_changed.store(true, Ordering::Release);
            }
        }
    }
}

impl Clone for EvFd {
    fn clone(&self) -> Self {
        EvFd::new_ref(&self.entry)
    }
}

impl Drop for EvFd {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.discard();
        }
    }
}

/// Deliver `revents` to the source's handler, then apply the HUP policy:
/// `auto_unref` discards the source, otherwise it is only disarmed so the
/// closed descriptor stops spinning the poller.
pub(crate) fn fd_dispatch(entry: &Arc<FdEntry>, revents: u32) {
    {
        let st = entry.state.lock().unwrap();
        if st.deleted {
            return;
        }
    }
    let tmp = EvFd::new_ref(entry);
    (entry.handler.lock().unwrap())(&tmp, revents);
    drop(tmp);
    if revents & EV_HUP != 0 {
        if entry.auto_unref {
            entry.discard();
        } else {
            let mut st = entry.state.lock().unwrap();
            if st.events & (EV_IN | EV_OUT) != 0 {
                st.events = 0;
                st.has_changed = true;
                drop(st);
                if let Some(mgr) = entry.mgr.upgrade() {
                    mgr.fds_changed.store(true, Ordering::Release);
                }
            }
        }
    }
}
