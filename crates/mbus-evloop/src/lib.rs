//! Cooperative event manager: one thread multiplexing file descriptors,
//! timers and prepare hooks.
//!
//! The manager runs a strict cycle
//! `Idle → Preparing → Ready → Waiting → Pending → Dispatching → Idle`.
//! Preparation runs the prepare hooks, recomputes the next timer deadline
//! and (re)arms the poller; the wait phase blocks on `mio::Poll` with the
//! timeout clamped by that deadline; the dispatch phase handles at most one
//! file-descriptor event plus any expired timers, which keeps callbacks
//! non-reentrant while staying responsive.
//!
//! `wakeup()` is backed by a [`mio::Waker`] and is legal from any thread,
//! including signal handlers (it boils down to one `write(2)`).

mod error;
mod fdwatch;
mod jobs;
mod mgr;
mod prepare;
mod timer;

pub use error::EvError;
pub use fdwatch::EvFd;
pub use jobs::JobQueue;
pub use mgr::{EvMgr, Holder, WakeupHandle, NO_HOLDER};
pub use prepare::EvPrepare;
pub use timer::EvTimer;

/// Readiness: data can be read.
pub const EV_IN: u32 = 1;
/// Readiness: data can be written.
pub const EV_OUT: u32 = 4;
/// Readiness: error condition on the descriptor.
pub const EV_ERR: u32 = 8;
/// Readiness: peer hung up.
pub const EV_HUP: u32 = 16;
