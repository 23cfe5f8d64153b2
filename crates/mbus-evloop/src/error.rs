use thiserror::Error;

/// Errors surfaced by the event manager.
#[derive(Debug, Error)]
pub enum EvError {
    /// The operation is not legal in the manager's current state
    /// (e.g. `wait` without a successful `prepare`).
    #[error("operation not allowed in current loop state")]
    BadState,

    /// The wait was interrupted by a wakeup before any event fired.
    #[error("wait interrupted by wakeup")]
    Interrupted,

    /// Underlying poller or wakeup primitive failed.
    #[error("event loop I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl EvError {
    /// `errno`-like negative code used on the wire and in replies.
    pub fn raw_code(&self) -> i32 {
        match self {
            EvError::BadState => -(libc::ENOTSUP),
            EvError::Interrupted => -(libc::EINTR),
            EvError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
