use thiserror::Error;

/// Errors of the socket and transport layer.
#[derive(Debug, Error)]
pub enum SockError {
    /// The URI does not follow the sockspec grammar.
    #[error("malformed socket uri: {0}")]
    BadUri(&'static str),

    /// Scheme recognised but not available on this platform.
    #[error("unsupported socket scheme: {0}")]
    Unsupported(String),

    /// No API name could be derived from the URI.
    #[error("no api name in uri")]
    NoApiName,

    /// The systemd listen-fds environment does not provide the socket.
    #[error("no inherited socket named {0:?}")]
    NoInheritedFd(String),

    /// Plain I/O failure.
    #[error("socket I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Event-loop registration failure.
    #[error("event loop failure: {0}")]
    Loop(#[from] mbus_evloop::EvError),

    /// Unix-level failure.
    #[error("socket failure: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// TLS setup or handshake failure.
    #[error("tls failure: {0}")]
    Tls(String),

    /// WebSocket handshake failure.
    #[error("websocket failure: {0}")]
    WebSocket(String),

    /// The wrapper lost its transport and has no reopen hook.
    #[error("transport closed")]
    Closed,
}

impl SockError {
    /// `errno`-like negative code used on the wire and in replies.
    pub fn raw_code(&self) -> i32 {
        match self {
            SockError::BadUri(_) | SockError::NoApiName => -(libc::EINVAL),
            SockError::Unsupported(_) => -(libc::EAFNOSUPPORT),
            SockError::NoInheritedFd(_) => -(libc::ENOENT),
            SockError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            SockError::Loop(e) => e.raw_code(),
            SockError::Sys(errno) => -(*errno as i32),
            SockError::Tls(_) | SockError::WebSocket(_) => -(libc::EPROTO),
            SockError::Closed => -(libc::EPIPE),
        }
    }
}
