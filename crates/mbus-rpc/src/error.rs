use thiserror::Error;

/// Errors of the RPC engine.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed frame or field.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The peer offered no mutually supported version.
    #[error("no mutually supported protocol version")]
    VersionMismatch,

    /// An application frame arrived before version negotiation completed.
    #[error("frame received before version negotiation")]
    NotNegotiated,

    /// The frame length field exceeds the allowed maximum.
    #[error("oversized frame")]
    Oversized,

    /// The stub is not connected to a transport.
    #[error("stub disconnected")]
    Disconnected,
}

impl RpcError {
    /// `errno`-like negative code used on the wire and in replies.
    pub fn raw_code(&self) -> i32 {
        match self {
            RpcError::Protocol(_) | RpcError::Oversized => -(libc::EPROTO),
            RpcError::VersionMismatch | RpcError::NotNegotiated => -(libc::EPROTONOSUPPORT),
            RpcError::Disconnected => -(libc::EPIPE),
        }
    }
}
