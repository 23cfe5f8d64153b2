//! Timers with decount and accuracy windows.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::mgr::MgrInner;

const PERIOD_DEFAULT_MS: u32 = 1000;
const PERIOD_MIN_MS: u32 = 1;
const ACCURACY_DEFAULT_MS: u32 = 1;
const ACCURACY_MIN_MS: u32 = 1;

pub(crate) fn clamp_period(ms: u32) -> Duration {
    Duration::from_millis(u64::from(match ms {
        0 => PERIOD_DEFAULT_MS,
        ms if ms < PERIOD_MIN_MS => PERIOD_MIN_MS,
        ms => ms,
    }))
}

pub(crate) fn clamp_accuracy(ms: u32) -> Duration {
    Duration::from_millis(u64::from(match ms {
        0 => ACCURACY_DEFAULT_MS,
        ms if ms < ACCURACY_MIN_MS => ACCURACY_MIN_MS,
        ms => ms,
    }))
}

pub(crate) type TimerHandler = Box<dyn FnMut(&EvTimer, u32) + Send>;

pub(crate) struct TimerState {
    pub next: Instant,
    pub period: Duration,
    pub accuracy: Duration,
    /// Remaining occurrences; 0 = infinite.
    pub decount: u32,
    pub active: bool,
    pub deleted: bool,
}

pub(crate) struct TimerEntry {
    pub auto_unref: bool,
    pub state: Mutex<TimerState>,
    pub refs: AtomicUsize,
    pub handler: Mutex<TimerHandler>,
    pub mgr: Weak<MgrInner>,
}

/// Handle on a programmed timer. Dropping every handle cancels the timer
/// at the next prepare; `auto_unref` timers cancel themselves after their
/// last occurrence.
pub struct EvTimer {
    entry: Arc<TimerEntry>,
}

impl EvTimer {
    pub(crate) fn from_entry(entry: Arc<TimerEntry>) -> Self {
        EvTimer { entry }
    }

    fn new_ref(entry: &Arc<TimerEntry>) -> Self {
        entry.refs.fetch_add(1, Ordering::Relaxed);
        EvTimer {
            entry: entry.clone(),
        }
    }

    /// Change the period; the next occurrence is rescheduled one full new
    /// period from now.
    pub fn modify_period(&self, period_ms: u32) {
        let mut st = self.entry.state.lock().unwrap();
        st.period = clamp_period(period_ms);
        st.next = Instant::now() + st.period;
    }
}

impl Clone for EvTimer {
    fn clone(&self) -> Self {
        EvTimer::new_ref(&self.entry)
    }
}

impl Drop for EvTimer {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut st = self.entry.state.lock().unwrap();
            st.active = false;
            st.deleted = true;
            drop(st);
            if let Some(mgr) = self.entry.mgr.upgrade() {
                mgr.timers_cleanup.store(true, Ordering::Release);
            }
        }
    }
}

pub(crate) fn timer_fire(entry: &Arc<TimerEntry>, decount: u32) {
    let tmp = EvTimer::new_ref(entry);
    (entry.handler.lock().unwrap())(&tmp, decount);
}
