use thiserror::Error;

/// Errors of the session/token/credential layer.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Level of assurance above 7.
    #[error("level of assurance out of range")]
    LoaOutOfRange,

    /// The session was closed and cannot be used anymore.
    #[error("session closed")]
    SessionClosed,

    /// A serialised credential string did not parse.
    #[error("malformed credential string")]
    BadCredentialString,

    /// The caller lacks a required permission.
    #[error("permission denied")]
    PermissionDenied,

    /// The platform refused to hand out peer credentials.
    #[error("peer credentials unavailable: {0}")]
    PeerCreds(#[from] nix::errno::Errno),
}

impl AuthError {
    /// `errno`-like negative code used on the wire and in replies.
    pub fn raw_code(&self) -> i32 {
        match self {
            AuthError::LoaOutOfRange | AuthError::BadCredentialString => -(libc::EINVAL),
            AuthError::SessionClosed => -(libc::ESTALE),
            AuthError::PermissionDenied => -(libc::EPERM),
            AuthError::PeerCreds(errno) => -(*errno as i32),
        }
    }
}
