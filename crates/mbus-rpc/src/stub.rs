//! The protocol stub: one per connection, tunnelling the request/reply/
//! event surface of a local runtime over frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mbus_auth::{Cred, Session, Token};
use mbus_core::{
    status, Api, ApiBuilder, CallReply, Event, EventSink, ReplyHandler, Request, Runtime, Verb,
};
use mbus_data::{Data, TypeRegistry};
use tracing::{debug, trace, warn};

use crate::coder::Coder;
use crate::error::RpcError;
use crate::frame::{Frame, FrameReader, WireParam, PROTOCOL_VERSION};
use crate::spec::RpcSpec;

type NotifyFn = Box<dyn FnMut(&Stub) -> i32 + Send>;

enum PendingTarget {
    /// A proxied local request: replies and subscriptions forward to it.
    Request(Request),
    /// A bare closure caller.
    Closure(Box<dyn FnOnce(CallReply) + Send>),
}

struct Defaults {
    session: Option<Session>,
    token: Option<Token>,
    cred: Option<Cred>,
}

struct StubInner {
    runtime: Runtime,
    spec: Arc<RpcSpec>,
    coder: Coder,
    notify: Mutex<Option<NotifyFn>>,
    unpack: AtomicBool,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingTarget>>,
    negotiated: Mutex<Option<u8>>,
    offered: AtomicBool,
    defaults: Mutex<Defaults>,
    /// Client view of the peer's events, by the peer's event id.
    remote_events: Mutex<HashMap<u16, Event>>,
    /// Sink pushing server-side events to the peer.
    peer_sink: Mutex<Option<Arc<dyn EventSink>>>,
}

/// Handle on one protocol stub. Clones share the connection state.
#[derive(Clone)]
pub struct Stub {
    inner: Arc<StubInner>,
}

/// Forwards event pushes of subscribed events onto the wire.
struct PeerSink {
    stub: Weak<StubInner>,
}

impl EventSink for PeerSink {
    fn on_event(&self, event: &Event, params: &[Data]) {
        if let Some(inner) = self.stub.upgrade() {
            let stub = Stub { inner };
            let params = encode_params(stub.inner.runtime.types(), params);
            stub.emit(&Frame::EventPush {
                event_id: event.id(),
                name: event.name().to_string(),
                params,
            });
        }
    }
}

/// Reply side of a call received from the peer.
struct StubReply {
    stub: Stub,
    id: u32,
}

impl ReplyHandler for StubReply {
    fn reply(&mut self, status_code: i32, params: Vec<Data>) {
        let params = encode_params(self.stub.inner.runtime.types(), &params);
        self.stub.emit(&Frame::Reply {
            id: self.id,
            status: status_code,
            params,
        });
    }

    fn subscribe(&mut self, event: &Event) -> i32 {
        let sink = self.stub.peer_sink();
        event.subscribe(&sink);
        self.stub.emit(&Frame::Subscribe {
            call_id: self.id,
            event_id: event.id(),
            name: event.name().to_string(),
        });
        0
    }

    fn unsubscribe(&mut self, event: &Event) -> i32 {
        let sink = self.stub.peer_sink();
        event.unsubscribe(&sink);
        self.stub.emit(&Frame::Unsubscribe {
            call_id: self.id,
            event_id: event.id(),
            name: event.name().to_string(),
        });
        0
    }
}

impl Stub {
    /// Stub serving (and calling into) `runtime` under the given
    /// import/export policy.
    pub fn new(runtime: &Runtime, spec: Arc<RpcSpec>) -> Stub {
        Stub {
            inner: Arc::new(StubInner {
                runtime: runtime.clone(),
                spec,
                coder: Coder::new(),
                notify: Mutex::new(None),
                unpack: AtomicBool::new(false),
                next_id: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                negotiated: Mutex::new(None),
                offered: AtomicBool::new(false),
                defaults: Mutex::new(Defaults {
                    session: None,
                    token: None,
                    cred: None,
                }),
                remote_events: Mutex::new(HashMap::new()),
                peer_sink: Mutex::new(None),
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn spec(&self) -> &Arc<RpcSpec> {
        &self.inner.spec
    }

    fn peer_sink(&self) -> Arc<dyn EventSink> {
        let mut slot = self.inner.peer_sink.lock().unwrap();
        if let Some(sink) = &*slot {
            return sink.clone();
        }
        let sink: Arc<dyn EventSink> = Arc::new(PeerSink {
            stub: Arc::downgrade(&self.inner),
        });
        *slot = Some(sink.clone());
        sink
    }

    // ------------------------------------------------------------------
    // Transport face
    // ------------------------------------------------------------------

    /// Register the function called whenever output frames are ready.
    pub fn set_notify<F>(&self, notify: F)
    where
        F: FnMut(&Stub) -> i32 + Send + 'static,
    {
        *self.inner.notify.lock().unwrap() = Some(Box::new(notify));
    }

    /// Message transports (websocket) need one whole message per frame.
    pub fn set_unpack(&self, unpack: bool) {
        self.inner.unpack.store(unpack, Ordering::Release);
    }

    pub fn unpack(&self) -> bool {
        self.inner.unpack.load(Ordering::Acquire)
    }

    /// The output queue the transport drains.
    pub fn coder(&self) -> &Coder {
        &self.inner.coder
    }

    pub fn emit_is_ready(&self) -> bool {
        self.inner.coder.is_ready()
    }

    /// Feed received bytes. Returns how many were consumed (0 when a
    /// partial frame needs more), or the protocol error that must hang
    /// the connection up.
    pub fn receive(&self, buf: &[u8]) -> Result<usize, RpcError> {
        let mut used = 0;
        while let Some((frame, n)) = FrameReader::parse(&buf[used..])? {
            used += n;
            self.on_frame(frame)?;
        }
        Ok(used)
    }

    /// The transport dropped: every in-flight call is replied with a
    /// disconnection status and negotiation restarts from scratch.
    pub fn disconnected(&self) {
        let pending: Vec<PendingTarget> = {
            let mut map = self.inner.pending.lock().unwrap();
            map.drain().map(|(_, target)| target).collect()
        };
        debug!(calls = pending.len(), "stub disconnected, failing in-flight calls");
        for target in pending {
            deliver(
                target,
                status::DISCONNECTED,
                vec![mbus_data::from_stringz("disconnected")],
            );
        }
        *self.inner.negotiated.lock().unwrap() = None;
        self.inner.offered.store(false, Ordering::Release);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Defaults
    // ------------------------------------------------------------------

    /// Default session of calls from this peer.
    pub fn set_session(&self, session: Session) {
        self.inner.defaults.lock().unwrap().session = Some(session);
    }

    /// Default token of calls from this peer.
    pub fn set_token(&self, token: Token) {
        self.inner.defaults.lock().unwrap().token = Some(token);
    }

    /// Credentials of the peer (from the transport).
    pub fn set_cred(&self, cred: Cred) {
        self.inner.defaults.lock().unwrap().cred = Some(cred);
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Send the version offer; must precede any application frame.
    pub fn offer_version(&self) {
        if !self.inner.offered.swap(true, Ordering::AcqRel) {
            self.emit(&Frame::VersionOffer {
                versions: vec![PROTOCOL_VERSION],
            });
        }
    }

    /// Declare the spec's imports as local proxy APIs routing into this
    /// stub.
    pub fn client_add(&self) -> Result<(), mbus_core::CoreError> {
        let mut declared = Vec::new();
        self.inner.spec.for_each(true, |local, remote| {
            declared.push((local.to_string(), remote.to_string()));
        });
        for (local, remote) in declared {
            let api = self.proxy_api(&local, &remote)?;
            self.inner.runtime.apis().add(api)?;
        }
        Ok(())
    }

    fn proxy_api(&self, local: &str, remote: &str) -> Result<Api, mbus_core::CoreError> {
        let stub = self.clone();
        let remote = remote.to_string();
        ApiBuilder::new(local)
            .info("remote api imported over rpc")
            .verb(
                Verb::new("*", move |req| {
                    stub.call_for_request(&remote, req);
                })
                .with_glob(),
            )
            .build()
    }

    /// Forward the local request `req` to the peer.
    fn call_for_request(&self, remote_api: &str, req: &Request) {
        let ctx = req.context();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(id, PendingTarget::Request(req.clone()));
        let params = encode_params(self.inner.runtime.types(), req.params());
        self.emit(&Frame::Call {
            id,
            api: remote_api.to_string(),
            verb: req.verb().to_string(),
            session: ctx.session_uuid(),
            token: ctx.token().map(|t| t.text().to_string()),
            creds: ctx.on_behalf_export(),
            params,
        });
    }

    /// Direct client call, without a local request.
    pub fn call<F>(&self, api: &str, verb: &str, params: Vec<Data>, on_reply: F)
    where
        F: FnOnce(CallReply) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(id, PendingTarget::Closure(Box::new(on_reply)));
        let params = encode_params(self.inner.runtime.types(), &params);
        self.emit(&Frame::Call {
            id,
            api: api.to_string(),
            verb: verb.to_string(),
            session: None,
            token: None,
            creds: None,
            params,
        });
    }

    // ------------------------------------------------------------------
    // Frame handling
    // ------------------------------------------------------------------

    fn emit(&self, frame: &Frame) {
        self.inner.coder.push(frame.encode());
        let mut notify = self.inner.notify.lock().unwrap().take();
        if let Some(cb) = &mut notify {
            let rc = cb(self);
            if rc < 0 {
                trace!(rc, "notify reported transport failure");
            }
        }
        // Restore unless the callback replaced itself meanwhile.
        if let Some(cb) = notify {
            let mut slot = self.inner.notify.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn is_negotiated(&self) -> bool {
        self.inner.negotiated.lock().unwrap().is_some()
    }

    fn on_frame(&self, frame: Frame) -> Result<(), RpcError> {
        match frame {
            Frame::VersionOffer { versions } => {
                let best = versions
                    .iter()
                    .copied()
                    .filter(|v| *v == PROTOCOL_VERSION)
                    .max()
                    .ok_or(RpcError::VersionMismatch)?;
                *self.inner.negotiated.lock().unwrap() = Some(best);
                self.emit(&Frame::VersionAccept { version: best });
                Ok(())
            }
            Frame::VersionAccept { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(RpcError::VersionMismatch);
                }
                *self.inner.negotiated.lock().unwrap() = Some(version);
                Ok(())
            }
            _ if !self.is_negotiated() => Err(RpcError::NotNegotiated),
            Frame::Call {
                id,
                api,
                verb,
                session,
                token,
                creds,
                params,
            } => {
                self.on_call(id, &api, &verb, session, token, creds, params);
                Ok(())
            }
            Frame::Reply { id, status, params } => {
                let target = self.inner.pending.lock().unwrap().remove(&id);
                match target {
                    Some(target) => {
                        let params = decode_params(self.inner.runtime.types(), params);
                        deliver(target, status, params);
                    }
                    None => warn!(id, "reply for unknown call id"),
                }
                Ok(())
            }
            Frame::Subscribe {
                call_id,
                event_id,
                name,
            } => {
                let event = self.remote_event(event_id, &name);
                let pending = self.inner.pending.lock().unwrap();
                match pending.get(&call_id) {
                    Some(PendingTarget::Request(req)) => {
                        req.subscribe(&event);
                    }
                    _ => debug!(call_id, event = %name, "subscription without forwardable caller"),
                }
                Ok(())
            }
            Frame::Unsubscribe {
                call_id,
                event_id,
                name,
            } => {
                let event = self.remote_event(event_id, &name);
                let pending = self.inner.pending.lock().unwrap();
                if let Some(PendingTarget::Request(req)) = pending.get(&call_id) {
                    req.unsubscribe(&event);
                }
                Ok(())
            }
            Frame::EventPush {
                event_id,
                name,
                params,
            } => {
                let event = self.inner.remote_events.lock().unwrap().get(&event_id).cloned();
                match event {
                    Some(event) => {
                        let params = decode_params(self.inner.runtime.types(), params);
                        event.push(&params);
                    }
                    None => debug!(event_id, event = %name, "push for unknown event"),
                }
                Ok(())
            }
            Frame::EventBroadcast { name, params } => {
                let params = decode_params(self.inner.runtime.types(), params);
                self.inner.runtime.broadcast(&name, &params);
                Ok(())
            }
            Frame::SessionSet { uuid } => {
                let (session, _) = self
                    .inner
                    .runtime
                    .sessions()
                    .get(Some(&uuid), mbus_auth::DEFAULT_SESSION_TIMEOUT_SECS);
                self.set_session(session);
                Ok(())
            }
            Frame::TokenSet { token } => {
                let token = self.inner.runtime.tokens().get(&token);
                self.set_token(token);
                Ok(())
            }
            Frame::CredSet { exported } => {
                match Cred::import(&exported) {
                    Ok(cred) => self.set_cred(cred),
                    Err(e) => warn!(error = %e, "ignoring malformed credentials frame"),
                }
                Ok(())
            }
            Frame::Goodbye => {
                debug!("peer said goodbye");
                Ok(())
            }
        }
    }

    fn remote_event(&self, event_id: u16, name: &str) -> Event {
        self.inner
            .remote_events
            .lock()
            .unwrap()
            .entry(event_id)
            .or_insert_with(|| Event::new(self.inner.runtime.event_ids(), name))
            .clone()
    }

    #[allow(clippy::too_many_arguments)]
    fn on_call(
        &self,
        id: u32,
        api: &str,
        verb: &str,
        session: Option<String>,
        token: Option<String>,
        creds: Option<String>,
        params: Vec<WireParam>,
    ) {
        let reply = Box::new(StubReply {
            stub: self.clone(),
            id,
        });

        // Export policy: a spec with exports serves only those names.
        let local = if self.inner.spec.has_exports() {
            match self.inner.spec.local_of_export(api) {
                Some(local) => local.to_string(),
                None => {
                    let req = Request::new(
                        &self.inner.runtime,
                        api,
                        verb,
                        vec![],
                        self.anonymous_context(None, None),
                        reply,
                    );
                    req.reply_error(status::UNKNOWN_API, "not-exported");
                    return;
                }
            }
        } else {
            api.to_string()
        };

        let ctx = self.anonymous_context(session, token);
        let params = decode_params(self.inner.runtime.types(), params);
        let req = Request::new(&self.inner.runtime, &local, verb, params, ctx.clone(), reply);

        match creds {
            Some(exported) if !exported.is_empty() => {
                let runtime = self.inner.runtime.clone();
                let req2 = req.clone();
                ctx.on_behalf_import_async(runtime.perm(), &exported, move |rc| {
                    if rc < 0 {
                        req2.reply_error(status::DENIED, "on-behalf-refused");
                    } else {
                        let rt = req2.runtime().clone();
                        rt.process(req2);
                    }
                });
            }
            _ => self.inner.runtime.process(req),
        }
    }

    /// Context of an incoming call: the frame's session/token when
    /// present, the stub defaults otherwise.
    fn anonymous_context(
        &self,
        session_uuid: Option<String>,
        token: Option<String>,
    ) -> Arc<mbus_auth::Context> {
        let defaults = self.inner.defaults.lock().unwrap();
        let session = match session_uuid {
            Some(uuid) => {
                self.inner
                    .runtime
                    .sessions()
                    .get(Some(&uuid), mbus_auth::DEFAULT_SESSION_TIMEOUT_SECS)
                    .0
            }
            None => match &defaults.session {
                Some(session) => session.clone(),
                None => self.inner.runtime.sessions().get(None, mbus_auth::DEFAULT_SESSION_TIMEOUT_SECS).0,
            },
        };
        let token = token
            .map(|t| self.inner.runtime.tokens().get(&t))
            .or_else(|| defaults.token.clone());
        let ctx = mbus_auth::Context::new(session, token);
        ctx.change_cred(defaults.cred.clone());
        ctx
    }
}

fn deliver(target: PendingTarget, status_code: i32, params: Vec<Data>) {
    match target {
        PendingTarget::Request(req) => req.reply(status_code, params),
        PendingTarget::Closure(cb) => cb(CallReply {
            status: status_code,
            params,
        }),
    }
}

// ---------------------------------------------------------------------------
// Parameter transport
// ---------------------------------------------------------------------------

/// Serialise values: streamable types go raw under their type name, the
/// others cross as their JSON form tagged with the original name.
fn encode_params(types: &Arc<TypeRegistry>, params: &[Data]) -> Vec<WireParam> {
    let mut wire = Vec::with_capacity(params.len());
    for data in params {
        let type_name = types
            .name(data.type_id())
            .unwrap_or_else(|_| "bytearray".to_string());
        let streamable = types.flags(data.type_id()).map(|f| f.streamable).unwrap_or(false);
        if streamable {
            if let Some(bytes) = data.read().bytes() {
                wire.push(WireParam {
                    type_name,
                    json_encoded: false,
                    bytes: bytes.to_vec(),
                });
                continue;
            }
        }
        match types.convert(data, mbus_data::JSON) {
            Ok(json) => {
                let bytes = json.read().bytes().map(<[u8]>::to_vec).unwrap_or_default();
                wire.push(WireParam {
                    type_name,
                    json_encoded: true,
                    bytes,
                });
            }
            Err(e) => {
                warn!(type_name = %type_name, error = %e, "dropping unserializable parameter");
            }
        }
    }
    wire
}

/// Rebuild values: raw payloads keep their type, JSON-encoded ones are
/// converted back to the declared type when possible.
fn decode_params(types: &Arc<TypeRegistry>, wire: Vec<WireParam>) -> Vec<Data> {
    let mut params = Vec::with_capacity(wire.len());
    for param in wire {
        let type_id = types.lookup(&param.type_name).ok();
        let data = match (type_id, param.json_encoded) {
            (Some(tid), false) => Data::new_raw(tid, param.bytes, None),
            (Some(tid), true) => {
                let json = Data::new_raw(mbus_data::JSON, param.bytes, None);
                types.convert(&json, tid).unwrap_or(json)
            }
            (None, false) => Data::new_raw(mbus_data::BYTEARRAY, param.bytes, None),
            (None, true) => Data::new_raw(mbus_data::JSON, param.bytes, None),
        };
        params.push(data);
    }
    params
}
