use thiserror::Error;

/// Reply status codes put on the wire and handed to reply callbacks.
/// Zero is success; negative values follow the platform `errno` family.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const UNKNOWN_API: i32 = -(libc::ENOENT);
    pub const UNKNOWN_VERB: i32 = -(libc::ENOENT);
    pub const DENIED: i32 = -(libc::EPERM);
    pub const INVALID: i32 = -(libc::EINVAL);
    pub const INTERNAL: i32 = -(libc::EIO);
    pub const DISCONNECTED: i32 = -(libc::EPIPE);
    pub const ABORTED: i32 = -(libc::ECANCELED);
}

/// Errors of the core registry and pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// API or verb name violating the naming rules.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// An API of that name is already registered.
    #[error("api already exists: {0}")]
    ApiExists(String),

    /// A verb of that name is already registered on the API.
    #[error("verb already exists: {0}")]
    VerbExists(String),

    /// The API was sealed; no further mutation is allowed.
    #[error("api is sealed")]
    Sealed,

    /// No API under that name.
    #[error("unknown api: {0}")]
    UnknownApi(String),

    /// No verb under that name.
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
}

impl CoreError {
    /// `errno`-like negative code used on the wire and in replies.
    pub fn raw_code(&self) -> i32 {
        match self {
            CoreError::InvalidName(_) => -(libc::EINVAL),
            CoreError::ApiExists(_) | CoreError::VerbExists(_) => -(libc::EEXIST),
            CoreError::Sealed => -(libc::EPERM),
            CoreError::UnknownApi(_) | CoreError::UnknownVerb(_) => -(libc::ENOENT),
        }
    }
}
