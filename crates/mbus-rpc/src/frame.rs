//! Frame model and the incremental wire parser.
//!
//! Every frame is `kind:u32, length:u32, id:u32` then `length` bytes of
//! body, all scalars in network order. `id` is 0 on unsolicited frames; a
//! reply reuses its call's id, and subscription notices carry the id of
//! the request that subscribed. The first exchange after connect must be
//! the version offer/accept pair.

use crate::error::RpcError;

/// Highest (and currently only) supported protocol version.
pub const PROTOCOL_VERSION: u8 = 3;

/// Ceiling on the body length; anything above is a framing violation.
const MAX_BODY: u32 = 16 * 1024 * 1024;

const HDR_LEN: usize = 12;

const KIND_VERSION_OFFER: u32 = 1;
const KIND_VERSION_ACCEPT: u32 = 2;
const KIND_CALL: u32 = 3;
const KIND_REPLY: u32 = 4;
const KIND_EVENT_PUSH: u32 = 5;
const KIND_EVENT_BROADCAST: u32 = 6;
const KIND_SUBSCRIBE: u32 = 7;
const KIND_UNSUBSCRIBE: u32 = 8;
const KIND_SESSION_SET: u32 = 9;
const KIND_TOKEN_SET: u32 = 10;
const KIND_CRED_SET: u32 = 11;
const KIND_GOODBYE: u32 = 12;

/// One serialised value: its declared type name, whether the payload was
/// re-encoded as JSON text for transport, and the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireParam {
    pub type_name: String,
    pub json_encoded: bool,
    pub bytes: Vec<u8>,
}

/// Decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    VersionOffer {
        versions: Vec<u8>,
    },
    VersionAccept {
        version: u8,
    },
    Call {
        id: u32,
        api: String,
        verb: String,
        session: Option<String>,
        token: Option<String>,
        creds: Option<String>,
        params: Vec<WireParam>,
    },
    Reply {
        id: u32,
        status: i32,
        params: Vec<WireParam>,
    },
    EventPush {
        event_id: u16,
        name: String,
        params: Vec<WireParam>,
    },
    EventBroadcast {
        name: String,
        params: Vec<WireParam>,
    },
    Subscribe {
        call_id: u32,
        event_id: u16,
        name: String,
    },
    Unsubscribe {
        call_id: u32,
        event_id: u16,
        name: String,
    },
    SessionSet {
        uuid: String,
    },
    TokenSet {
        token: String,
    },
    CredSet {
        exported: String,
    },
    Goodbye,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_str(out: &mut Vec<u8>, s: &str) {
    let len = u16::try_from(s.len()).unwrap_or(u16::MAX - 1);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&s.as_bytes()[..usize::from(len)]);
}

fn put_opt_str(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => put_str(out, s),
        None => out.extend_from_slice(&u16::MAX.to_be_bytes()),
    }
}

fn put_params(out: &mut Vec<u8>, params: &[WireParam]) {
    let count = u16::try_from(params.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&count.to_be_bytes());
    for param in &params[..usize::from(count)] {
        put_str(out, &param.type_name);
        out.push(u8::from(param.json_encoded));
        out.extend_from_slice(&u32::try_from(param.bytes.len()).unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&param.bytes);
    }
}

impl Frame {
    /// Serialise the frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, id, body) = self.encode_body();
        let mut out = Vec::with_capacity(HDR_LEN + body.len());
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(&u32::try_from(body.len()).expect("frame body fits").to_be_bytes());
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn encode_body(&self) -> (u32, u32, Vec<u8>) {
        let mut body = Vec::new();
        match self {
            Frame::VersionOffer { versions } => {
                body.push(u8::try_from(versions.len()).unwrap_or(u8::MAX));
                body.extend_from_slice(versions);
                (KIND_VERSION_OFFER, 0, body)
            }
            Frame::VersionAccept { version } => {
                body.push(*version);
                (KIND_VERSION_ACCEPT, 0, body)
            }
            Frame::Call {
                id,
                api,
                verb,
                session,
                token,
                creds,
                params,
            } => {
                put_str(&mut body, api);
                put_str(&mut body, verb);
                put_opt_str(&mut body, session.as_deref());
                put_opt_str(&mut body, token.as_deref());
                put_opt_str(&mut body, creds.as_deref());
                put_params(&mut body, params);
                (KIND_CALL, *id, body)
            }
            Frame::Reply { id, status, params } => {
                body.extend_from_slice(&status.to_be_bytes());
                put_params(&mut body, params);
                (KIND_REPLY, *id, body)
            }
            Frame::EventPush {
                event_id,
                name,
                params,
            } => {
                body.extend_from_slice(&event_id.to_be_bytes());
                put_str(&mut body, name);
                put_params(&mut body, params);
                (KIND_EVENT_PUSH, 0, body)
            }
            Frame::EventBroadcast { name, params } => {
                put_str(&mut body, name);
                put_params(&mut body, params);
                (KIND_EVENT_BROADCAST, 0, body)
            }
            Frame::Subscribe {
                call_id,
                event_id,
                name,
            } => {
                body.extend_from_slice(&event_id.to_be_bytes());
                put_str(&mut body, name);
                (KIND_SUBSCRIBE, *call_id, body)
            }
            Frame::Unsubscribe {
                call_id,
                event_id,
                name,
            } => {
                body.extend_from_slice(&event_id.to_be_bytes());
                put_str(&mut body, name);
                (KIND_UNSUBSCRIBE, *call_id, body)
            }
            Frame::SessionSet { uuid } => {
                put_str(&mut body, uuid);
                (KIND_SESSION_SET, 0, body)
            }
            Frame::TokenSet { token } => {
                put_str(&mut body, token);
                (KIND_TOKEN_SET, 0, body)
            }
            Frame::CredSet { exported } => {
                put_str(&mut body, exported);
                (KIND_CRED_SET, 0, body)
            }
            Frame::Goodbye => (KIND_GOODBYE, 0, body),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RpcError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(RpcError::Protocol("truncated body"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RpcError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RpcError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, RpcError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, RpcError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String, RpcError> {
        let len = self.u16()?;
        let bytes = self.take(usize::from(len))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| RpcError::Protocol("non-utf8 string"))
    }

    fn opt_str(&mut self) -> Result<Option<String>, RpcError> {
        let len = self.u16()?;
        if len == u16::MAX {
            return Ok(None);
        }
        let bytes = self.take(usize::from(len))?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| RpcError::Protocol("non-utf8 string"))
    }

    fn params(&mut self) -> Result<Vec<WireParam>, RpcError> {
        let count = self.u16()?;
        let mut params = Vec::with_capacity(usize::from(count.min(64)));
        for _ in 0..count {
            let type_name = self.str()?;
            let json_encoded = self.u8()? != 0;
            let len = self.u32()?;
            let bytes = self.take(len as usize)?.to_vec();
            params.push(WireParam {
                type_name,
                json_encoded,
                bytes,
            });
        }
        Ok(params)
    }
}

/// Incremental frame parser over an append buffer.
#[derive(Default)]
pub struct FrameReader;

impl FrameReader {
    /// Try to parse one frame at the start of `buf`. Returns the frame
    /// and the bytes it consumed, or `None` when more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, RpcError> {
        if buf.len() < HDR_LEN {
            return Ok(None);
        }
        let kind = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let id = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        if length > MAX_BODY {
            return Err(RpcError::Oversized);
        }
        let total = HDR_LEN + length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let mut cur = Cursor {
            buf: &buf[HDR_LEN..total],
            pos: 0,
        };
        let frame = match kind {
            KIND_VERSION_OFFER => {
                let count = cur.u8()?;
                let versions = cur.take(usize::from(count))?.to_vec();
                Frame::VersionOffer { versions }
            }
            KIND_VERSION_ACCEPT => Frame::VersionAccept {
                version: cur.u8()?,
            },
            KIND_CALL => Frame::Call {
                id,
                api: cur.str()?,
                verb: cur.str()?,
                session: cur.opt_str()?,
                token: cur.opt_str()?,
                creds: cur.opt_str()?,
                params: cur.params()?,
            },
            KIND_REPLY => Frame::Reply {
                id,
                status: cur.i32()?,
                params: cur.params()?,
            },
            KIND_EVENT_PUSH => Frame::EventPush {
                event_id: cur.u16()?,
                name: cur.str()?,
                params: cur.params()?,
            },
            KIND_EVENT_BROADCAST => Frame::EventBroadcast {
                name: cur.str()?,
                params: cur.params()?,
            },
            KIND_SUBSCRIBE => Frame::Subscribe {
                call_id: id,
                event_id: cur.u16()?,
                name: cur.str()?,
            },
            KIND_UNSUBSCRIBE => Frame::Unsubscribe {
                call_id: id,
                event_id: cur.u16()?,
                name: cur.str()?,
            },
            KIND_SESSION_SET => Frame::SessionSet { uuid: cur.str()? },
            KIND_TOKEN_SET => Frame::TokenSet { token: cur.str()? },
            KIND_CRED_SET => Frame::CredSet {
                exported: cur.str()?,
            },
            KIND_GOODBYE => Frame::Goodbye,
            _ => return Err(RpcError::Protocol("unknown frame kind")),
        };
        Ok(Some((frame, total)))
    }
}
