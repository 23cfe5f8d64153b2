//! The event manager proper: state machine, poller, wakeup and holder.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::trace;

use crate::error::EvError;
use crate::fdwatch::{EvFd, FdEntry, FdHandler, FdState};
use crate::jobs::{JobQueue, JobsShared};
use crate::prepare::{EvPrepare, PrepareEntry, PrepareHandler};
use crate::timer::{clamp_accuracy, clamp_period, EvTimer, TimerEntry, TimerHandler, TimerState};
use crate::{EV_ERR, EV_HUP, EV_IN, EV_OUT};

/// Cooperative ownership token; [`NO_HOLDER`] when nobody drives the loop.
pub type Holder = usize;

/// The "nobody" holder value.
pub const NO_HOLDER: Holder = 0;

const WAKER_TOKEN: Token = Token(0);

// Cycle states, in order.
const IDLE: u8 = 0;
const PREPARING: u8 = 1;
const READY: u8 = 2;
const WAITING: u8 = 3;
const PENDING: u8 = 4;
const DISPATCHING: u8 = 5;

pub(crate) struct MgrInner {
    poll: Mutex<Poll>,
    events: Mutex<Events>,
    pub(crate) registry: Registry,
    waker: Arc<Waker>,
    state: AtomicU8,
    holder: AtomicUsize,

    pub(crate) fds: Mutex<Vec<Arc<FdEntry>>>,
    pub(crate) fds_changed: AtomicBool,
    pub(crate) fds_cleanup: AtomicBool,

    pub(crate) timers: Mutex<Vec<Arc<TimerEntry>>>,
    pub(crate) timers_cleanup: AtomicBool,

    pub(crate) preparers: Mutex<Vec<Arc<PrepareEntry>>>,
    pub(crate) preparers_cleanup: AtomicBool,

    /// Next armed timer deadline; recomputed at every prepare.
    armed: Mutex<Option<Instant>>,

    /// The single fd event captured by the last wait, awaiting dispatch.
    pending: Mutex<Option<(Token, u32)>>,

    jobs: Arc<JobsShared>,
    token_seq: AtomicUsize,
}

/// Handle on the event manager. Cheap to clone; all clones drive the same
/// loop. The manager itself is single-threaded by convention: only
/// [`EvMgr::wakeup`] and job posting are meant for foreign threads.
#[derive(Clone)]
pub struct EvMgr {
    inner: Arc<MgrInner>,
}

/// Cross-thread wakeup handle; safe to use from signal context.
#[derive(Clone)]
pub struct WakeupHandle {
    waker: Arc<Waker>,
}

impl WakeupHandle {
    /// Wake the loop if it waits; otherwise the next wait returns at once.
    pub fn wakeup(&self) {
        let _ = self.waker.wake();
    }
}

impl EvMgr {
    /// Create a manager with its poller and wakeup primitive.
    pub fn new() -> Result<Self, EvError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(EvMgr {
            inner: Arc::new(MgrInner {
                poll: Mutex::new(poll),
                events: Mutex::new(Events::with_capacity(1)),
                registry,
                waker: waker.clone(),
                state: AtomicU8::new(IDLE),
                holder: AtomicUsize::new(NO_HOLDER),
                fds: Mutex::new(Vec::new()),
                fds_changed: AtomicBool::new(false),
                fds_cleanup: AtomicBool::new(false),
                timers: Mutex::new(Vec::new()),
                timers_cleanup: AtomicBool::new(false),
                preparers: Mutex::new(Vec::new()),
                preparers_cleanup: AtomicBool::new(false),
                armed: Mutex::new(None),
                pending: Mutex::new(None),
                jobs: Arc::new(JobsShared::new(waker)),
                token_seq: AtomicUsize::new(1),
            }),
        })
    }

    /// Wake the loop if it waits.
    pub fn wakeup(&self) {
        let _ = self.inner.waker.wake();
    }

    /// Obtain a cloneable, `Send` wakeup handle.
    pub fn wakeup_handle(&self) -> WakeupHandle {
        WakeupHandle {
            waker: self.inner.waker.clone(),
        }
    }

    /// Queue for posting closures run at the next prepare phase.
    pub fn jobs(&self) -> JobQueue {
        JobQueue::new(self.inner.jobs.clone())
    }

    /// Run the queued jobs now, without a full cycle. Used by synchronous
    /// waiters that cannot re-enter the loop.
    pub fn flush_jobs(&self) {
        self.inner.jobs.run_pending();
    }

    /// Current holder of the loop.
    pub fn holder(&self) -> Holder {
        self.inner.holder.load(Ordering::Acquire)
    }

    /// Set `next` as holder if `holder` is the current one.
    /// Returns the holder in effect afterwards.
    pub fn try_change_holder(&self, holder: Holder, next: Holder) -> Holder {
        let _ = self.inner.holder.compare_exchange(
            holder,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.holder.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    /// Watch a file descriptor for the readiness mask `events`
    /// (combination of [`EV_IN`]/[`EV_OUT`]; [`EV_ERR`]/[`EV_HUP`] are
    /// always reported).
    ///
    /// `auto_unref` drops the source after HUP delivery; `auto_close`
    /// closes the descriptor when the source is discarded.
    pub fn add_fd<H>(
        &self,
        fd: std::os::unix::io::RawFd,
        events: u32,
        handler: H,
        auto_unref: bool,
        auto_close: bool,
    ) -> Result<EvFd, EvError>
    where
        H: FnMut(&EvFd, u32) + Send + 'static,
    {
        let token = Token(self.inner.token_seq.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(FdEntry {
            token,
            fd,
            auto_close,
            auto_unref,
            state: Mutex::new(FdState {
                events,
                is_set: false,
                has_changed: false,
                deleted: false,
            }),
            refs: AtomicUsize::new(1),
            handler: Mutex::new(Box::new(handler) as FdHandler),
            mgr: Arc::downgrade(&self.inner),
        });
        self.inner.fds.lock().unwrap().push(entry.clone());
        self.inner.fds_changed.store(true, Ordering::Release);
        Ok(EvFd::from_entry(entry))
    }

    /// Program a timer.
    ///
    /// When `absolute`, `start_sec` is seconds since the Unix epoch,
    /// otherwise a relative delay; `start_ms` adds milliseconds. `count`
    /// is the number of occurrences (0 = infinite); the handler receives
    /// the remaining decount (`count..=1`, or 0 for infinite timers).
    /// Zero `period_ms`/`accuracy_ms` select the defaults (1000ms / 1ms).
    #[allow(clippy::too_many_arguments)]
    pub fn add_timer<H>(
        &self,
        absolute: bool,
        start_sec: u64,
        start_ms: u32,
        count: u32,
        period_ms: u32,
        accuracy_ms: u32,
        handler: H,
        auto_unref: bool,
    ) -> Result<EvTimer, EvError>
    where
        H: FnMut(&EvTimer, u32) + Send + 'static,
    {
        let now = Instant::now();
        let delay_ms = if absolute {
            let epoch_now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs();
            start_sec.saturating_sub(epoch_now) * 1000 + u64::from(start_ms)
        } else {
            start_sec * 1000 + u64::from(start_ms)
        };
        let entry = Arc::new(TimerEntry {
            auto_unref,
            state: Mutex::new(TimerState {
                next: now + Duration::from_millis(delay_ms),
                period: clamp_period(period_ms),
                accuracy: clamp_accuracy(accuracy_ms),
                decount: count,
                active: true,
                deleted: false,
            }),
            refs: AtomicUsize::new(1),
            handler: Mutex::new(Box::new(handler) as TimerHandler),
            mgr: Arc::downgrade(&self.inner),
        });
        self.inner.timers.lock().unwrap().push(entry.clone());
        self.timer_set(None);
        Ok(EvTimer::from_entry(entry))
    }

    /// Register a hook run at every prepare phase.
    pub fn add_prepare<H>(&self, handler: H) -> Result<EvPrepare, EvError>
    where
        H: FnMut() + Send + 'static,
    {
        let entry = Arc::new(PrepareEntry {
            refs: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
            handler: Mutex::new(Box::new(handler) as PrepareHandler),
            mgr: Arc::downgrade(&self.inner),
        });
        self.inner.preparers.lock().unwrap().push(entry.clone());
        Ok(EvPrepare::from_entry(entry))
    }

    // ------------------------------------------------------------------
    // Cycle phases
    // ------------------------------------------------------------------

    /// Run the prepare phase with no extra wakeup bound.
    pub fn prepare(&self) -> Result<(), EvError> {
        self.do_prepare(None)
    }

    /// Run the prepare phase, bounding the next wait to `wakeup_ms`.
    pub fn prepare_with_wakeup(&self, wakeup_ms: i32) -> Result<(), EvError> {
        let upper = if wakeup_ms >= 0 {
            Some(Instant::now() + Duration::from_millis(wakeup_ms as u64))
        } else {
            None
        };
        self.do_prepare(upper)
    }

    /// Wait for an event for at most `timeout_ms` (negative = no limit),
    /// clamped by the armed timer deadline.
    ///
    /// Returns `Ok(true)` when something awaits dispatch (fd event or
    /// expired timer), `Ok(false)` on a plain timeout, and
    /// `Err(EvError::Interrupted)` when a wakeup consumed the wait.
    pub fn wait(&self, timeout_ms: i32) -> Result<bool, EvError> {
        let inner = &self.inner;
        if inner.state.load(Ordering::Acquire) != READY {
            return Err(EvError::BadState);
        }
        inner.state.store(WAITING, Ordering::Release);

        let armed = *inner.armed.lock().unwrap();
        let now = Instant::now();
        let mut timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };
        if let Some(deadline) = armed {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }

        let poll_result = {
            let mut poll = inner.poll.lock().unwrap();
            let mut events = inner.events.lock().unwrap();
            poll.poll(&mut events, timeout)
                .map(|()| events.iter().next().map(|ev| (ev.token(), readiness(ev))))
        };

        match poll_result {
            Err(e) => {
                inner.state.store(IDLE, Ordering::Release);
                Err(EvError::Io(e))
            }
            Ok(None) => {
                // Timeout. With a timer armed, there is work to dispatch.
                if armed.is_some() {
                    *inner.armed.lock().unwrap() = None;
                    *inner.pending.lock().unwrap() = None;
                    inner.state.store(PENDING, Ordering::Release);
                    Ok(true)
                } else {
                    inner.state.store(IDLE, Ordering::Release);
                    Ok(false)
                }
            }
            Ok(Some((token, _))) if token == WAKER_TOKEN => {
                inner.state.store(IDLE, Ordering::Release);
                Err(EvError::Interrupted)
            }
            Ok(Some((token, revents))) => {
                *inner.pending.lock().unwrap() = Some((token, revents));
                inner.state.store(PENDING, Ordering::Release);
                Ok(true)
            }
        }
    }

    /// Dispatch the captured fd event (at most one) and the expired timers.
    pub fn dispatch(&self) {
        let inner = &self.inner;
        if inner.state.load(Ordering::Acquire) != PENDING {
            return;
        }
        inner.state.store(DISPATCHING, Ordering::Release);
        self.timer_dispatch();
        let pending = inner.pending.lock().unwrap().take();
        if let Some((token, revents)) = pending {
            let entry = inner
                .fds
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.token == token)
                .cloned();
            if let Some(entry) = entry {
                crate::fdwatch::fd_dispatch(&entry, revents);
            }
        }
        inner.state.store(IDLE, Ordering::Release);
    }

    /// One full cycle: prepare, wait, dispatch.
    pub fn run(&self, timeout_ms: i32) -> Result<bool, EvError> {
        self.prepare()?;
        let fired = self.wait(timeout_ms)?;
        if fired {
            self.dispatch();
        }
        Ok(fired)
    }

    /// Whether a cycle may start now.
    pub fn can_run(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == IDLE
    }

    /// Force the state machine back to idle after a callback panic was
    /// caught upstream.
    pub fn recover_run(&self) {
        self.inner.state.store(IDLE, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn do_prepare(&self, upper: Option<Instant>) -> Result<(), EvError> {
        let inner = &self.inner;
        let state = inner.state.load(Ordering::Acquire);
        if state != IDLE && state != READY {
            return Err(EvError::BadState);
        }
        inner.state.store(PREPARING, Ordering::Release);

        inner.jobs.run_pending();
        self.cleanup();
        self.preparers_prepare();
        *inner.armed.lock().unwrap() = None;
        self.timer_set(upper);
        let rc = if inner.fds_changed.swap(false, Ordering::AcqRel) {
            self.fds_prepare()
        } else {
            Ok(())
        };
        inner.state.store(READY, Ordering::Release);
        rc
    }

    fn cleanup(&self) {
        let inner = &self.inner;
        if inner.fds_cleanup.swap(false, Ordering::AcqRel) {
            let mut fds = inner.fds.lock().unwrap();
            fds.retain(|entry| {
                let st = entry.state.lock().unwrap();
                if !st.deleted {
                    return true;
                }
                if st.is_set {
                    let _ = inner.registry.deregister(&mut SourceFd(&entry.fd));
                }
                if entry.auto_close {
                    // Last user reference is gone; the fd belongs to us now.
                    unsafe { libc::close(entry.fd) };
                }
                false
            });
        }
        if inner.timers_cleanup.swap(false, Ordering::AcqRel) {
            inner
                .timers
                .lock()
                .unwrap()
                .retain(|t| !t.state.lock().unwrap().deleted);
        }
        if inner.preparers_cleanup.swap(false, Ordering::AcqRel) {
            inner
                .preparers
                .lock()
                .unwrap()
                .retain(|p| !p.deleted.load(Ordering::Acquire));
        }
    }

    fn preparers_prepare(&self) {
        let hooks: Vec<_> = self.inner.preparers.lock().unwrap().clone();
        for hook in hooks {
            if !hook.deleted.load(Ordering::Acquire) {
                (hook.handler.lock().unwrap())();
            }
        }
    }

    fn fds_prepare(&self) -> Result<(), EvError> {
        let inner = &self.inner;
        let fds: Vec<_> = inner.fds.lock().unwrap().clone();
        for entry in fds {
            let mut st = entry.state.lock().unwrap();
            let wanted = !st.deleted && st.events & (EV_IN | EV_OUT) != 0;
            if wanted && !st.is_set {
                inner
                    .registry
                    .register(&mut SourceFd(&entry.fd), entry.token, interest(st.events))?;
                st.is_set = true;
                st.has_changed = false;
            } else if !wanted && st.is_set {
                inner.registry.deregister(&mut SourceFd(&entry.fd))?;
                st.is_set = false;
                st.has_changed = false;
            } else if wanted && st.has_changed {
                inner.registry.reregister(
                    &mut SourceFd(&entry.fd),
                    entry.token,
                    interest(st.events),
                )?;
                st.has_changed = false;
            }
        }
        Ok(())
    }

    /// Recompute the next deadline: the midpoint of the minimum overlap of
    /// all `[next, next+accuracy]` windows, optionally bounded by `upper`.
    pub(crate) fn timer_set(&self, upper_bound: Option<Instant>) {
        let far = Instant::now() + Duration::from_secs(86400 * 365);
        let mut upper = upper_bound.unwrap_or(far);
        let mut lower: Option<Instant> = None;
        for timer in self.inner.timers.lock().unwrap().iter() {
            let st = timer.state.lock().unwrap();
            if !st.active || st.deleted {
                continue;
            }
            let lo = st.next;
            if lo > upper {
                continue;
            }
            let up = lo + st.accuracy;
            match lower {
                Some(l) if up > l => {
                    if lo > l {
                        lower = Some(lo);
                    }
                    if up < upper {
                        upper = up;
                    }
                }
                _ => {
                    lower = Some(lo);
                    upper = up;
                }
            }
        }
        if let Some(lo) = lower {
            let when = lo + (upper.saturating_duration_since(lo)) / 2;
            self.arm(when);
        } else if let Some(up) = upper_bound {
            self.arm(up);
        }
    }

    fn arm(&self, when: Instant) {
        let mut armed = self.inner.armed.lock().unwrap();
        if armed.map_or(true, |cur| when < cur) {
            *armed = Some(when);
            if self.inner.state.load(Ordering::Acquire) == WAITING {
                // A foreign thread moved the deadline while we wait.
                let _ = self.inner.waker.wake();
            }
        }
    }

    fn timer_dispatch(&self) {
        let now = Instant::now();
        let due: Vec<_> = self
            .inner
            .timers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| {
                let st = t.state.lock().unwrap();
                st.active && !st.deleted && st.next <= now
            })
            .cloned()
            .collect();
        for timer in due {
            let decount = timer.state.lock().unwrap().decount;
            trace!(decount, "timer fired");
            crate::timer::timer_fire(&timer, decount);
            let mut st = timer.state.lock().unwrap();
            // Skip occurrences that fell behind entirely.
            while st.next <= now {
                let period = st.period;
                st.next += period;
            }
            if st.decount > 0 {
                st.decount -= 1;
                if st.decount == 0 {
                    st.active = false;
                    if timer.auto_unref {
                        st.deleted = true;
                        self.inner.timers_cleanup.store(true, Ordering::Release);
                    }
                }
            }
        }
    }
}

fn interest(events: u32) -> Interest {
    match (events & EV_IN != 0, events & EV_OUT != 0) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

fn readiness(ev: &mio::event::Event) -> u32 {
    let mut mask = 0;
    if ev.is_readable() {
        mask |= EV_IN;
    }
    if ev.is_writable() {
        mask |= EV_OUT;
    }
    if ev.is_error() {
        mask |= EV_ERR;
    }
    if ev.is_read_closed() || ev.is_write_closed() {
        mask |= EV_HUP;
    }
    mask
}
