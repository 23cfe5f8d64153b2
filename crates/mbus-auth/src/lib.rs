//! Identity carried by requests: sessions, bearer tokens, credentials, and
//! the asynchronous permission pipeline that gates verb execution.

mod context;
mod cred;
mod error;
mod perm;
mod session;
mod token;

pub use context::Context;
pub use cred::Cred;
pub use error::AuthError;
pub use perm::{
    AllowAll, Authority, Decision, PermQuery, PermissionEngine, PERM_ON_BEHALF, PERM_TOKEN_VALID,
};
pub use session::{Session, SessionSet, DEFAULT_SESSION_TIMEOUT_SECS};
pub use token::{Token, TokenCache};

/// Highest level of assurance a session may record.
pub const LOA_MAX: u8 = 7;
