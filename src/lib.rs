//! microbus: an in-process micro-service binder.
//!
//! Many small service APIs live inside one process, call one another,
//! subscribe to events and expose themselves to remote peers over raw
//! TCP, TLS, Unix or WebSocket transports — all on one cooperative
//! event loop. This facade re-exports the member crates under their
//! domain names.

pub use mbus_auth as auth;
pub use mbus_core as core;
pub use mbus_data as data;
pub use mbus_evloop as evloop;
pub use mbus_rpc as rpc;
pub use mbus_sock as sock;
