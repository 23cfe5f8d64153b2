//! Sockets and transports: the `scheme:host:port/…?as-api=…` grammar,
//! per-scheme descriptor opening, and the wrappers binding a protocol
//! stub to plain, TLS or WebSocket byte streams with reconnection.

mod error;
mod listener;
mod socket;
mod uri;
mod wrapper;

pub use error::SockError;
pub use listener::{autoset_resolver, connect, Listener};
pub use socket::{open_spec, Side};
pub use uri::{SockScheme, SockSpec, WrapFlags};
pub use wrapper::{Robustify, Wrapper};
