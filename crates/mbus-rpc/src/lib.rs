//! The RPC engine: a compact self-framed binary protocol tunnelling
//! requests, replies and events over any byte stream, plus the stub that
//! speaks it on behalf of a local api set.
//!
//! Nothing here touches sockets: the transport wrappers feed bytes into
//! [`Stub::receive`] and drain the output coder when notified. That keeps
//! the engine testable back-to-back with two stubs and a loopback.

mod coder;
mod error;
mod frame;
mod spec;
mod stub;

pub use coder::Coder;
pub use error::RpcError;
pub use frame::{Frame, FrameReader, WireParam, PROTOCOL_VERSION};
pub use spec::RpcSpec;
pub use stub::Stub;
