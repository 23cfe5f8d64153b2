//! The common request: lifecycle, reply path, subscriptions, subcalls.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mbus_auth::Context;
use mbus_data::Data;
use tracing::warn;

use crate::error::status;
use crate::event::Event;
use crate::logmask::{vlog, LogLevel, LogMask};
use crate::runtime::Runtime;

/// A completed reply, as observed by the caller.
#[derive(Clone)]
pub struct CallReply {
    pub status: i32,
    pub params: Vec<Data>,
}

impl CallReply {
    pub fn ok(&self) -> bool {
        self.status >= 0
    }
}

/// Caller-side channel of a request: receives the reply and, for remote
/// callers, learns about event subscriptions so pushes can be forwarded.
pub trait ReplyHandler: Send {
    fn reply(&mut self, status: i32, params: Vec<Data>);

    fn subscribe(&mut self, event: &Event) -> i32 {
        let _ = event;
        0
    }

    fn unsubscribe(&mut self, event: &Event) -> i32 {
        let _ = event;
        0
    }
}

/// Reply handler backed by a one-shot closure; the usual local caller.
pub struct ClosureReply {
    on_reply: Option<Box<dyn FnOnce(CallReply) + Send>>,
}

impl ClosureReply {
    pub fn new<F: FnOnce(CallReply) + Send + 'static>(on_reply: F) -> Box<ClosureReply> {
        Box::new(ClosureReply {
            on_reply: Some(Box::new(on_reply)),
        })
    }
}

impl ReplyHandler for ClosureReply {
    fn reply(&mut self, status: i32, params: Vec<Data>) {
        if let Some(cb) = self.on_reply.take() {
            cb(CallReply { status, params });
        }
    }
}

struct ReqInner {
    api: String,
    verb: String,
    params: Vec<Data>,
    context: Arc<Context>,
    runtime: Runtime,
    replied: AtomicBool,
    reply_to: Mutex<Option<Box<dyn ReplyHandler>>>,
    logmask: Mutex<LogMask>,
    userdata: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// One in-flight request. Clones share the same lifecycle; `reply` has an
/// effect exactly once, later calls are dropped with a warning.
#[derive(Clone)]
pub struct Request {
    inner: Arc<ReqInner>,
}

impl Request {
    pub fn new(
        runtime: &Runtime,
        api: &str,
        verb: &str,
        params: Vec<Data>,
        context: Arc<Context>,
        reply_to: Box<dyn ReplyHandler>,
    ) -> Request {
        Request {
            inner: Arc::new(ReqInner {
                api: api.to_string(),
                verb: verb.to_string(),
                params,
                context,
                runtime: runtime.clone(),
                replied: AtomicBool::new(false),
                reply_to: Mutex::new(Some(reply_to)),
                logmask: Mutex::new(LogMask::default_mask()),
                userdata: Mutex::new(None),
            }),
        }
    }

    pub fn api(&self) -> &str {
        &self.inner.api
    }

    pub fn verb(&self) -> &str {
        &self.inner.verb
    }

    pub fn params(&self) -> &[Data] {
        &self.inner.params
    }

    pub fn context(&self) -> Arc<Context> {
        self.inner.context.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn has_replied(&self) -> bool {
        self.inner.replied.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Reply
    // ------------------------------------------------------------------

    /// Deliver the reply. The first call wins; any further reply is
    /// ignored with a logged warning.
    pub fn reply(&self, status_code: i32, params: Vec<Data>) {
        if self.inner.replied.swap(true, Ordering::AcqRel) {
            warn!(
                api = %self.inner.api,
                verb = %self.inner.verb,
                "reply called twice, dropping the second"
            );
            return;
        }
        if let Some(mut handler) = self.inner.reply_to.lock().unwrap().take() {
            handler.reply(status_code, params);
        }
        self.inner.context.disconnect();
    }

    /// Success shorthand.
    pub fn reply_ok(&self, params: Vec<Data>) {
        self.reply(status::SUCCESS, params);
    }

    /// Error shorthand carrying a `stringz` explanation.
    pub fn reply_error(&self, status_code: i32, text: &str) {
        self.reply(status_code, vec![mbus_data::from_stringz(text)]);
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe the caller of this request to `event`.
    pub fn subscribe(&self, event: &Event) -> i32 {
        match &mut *self.inner.reply_to.lock().unwrap() {
            Some(handler) => handler.subscribe(event),
            None => status::ABORTED,
        }
    }

    pub fn unsubscribe(&self, event: &Event) -> i32 {
        match &mut *self.inner.reply_to.lock().unwrap() {
            Some(handler) => handler.unsubscribe(event),
            None => status::ABORTED,
        }
    }

    // ------------------------------------------------------------------
    // Identity shortcuts
    // ------------------------------------------------------------------

    /// Asynchronous permission check on the request's identity.
    pub fn check_permission_async<F>(&self, permission: &str, on_done: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        self.inner
            .context
            .has_permission_async(self.inner.runtime.perm(), permission, on_done);
    }

    /// Close the session once this request terminates.
    pub fn session_close(&self) {
        self.inner.context.close();
    }

    pub fn set_loa_async<F>(&self, loa: u8, on_done: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        self.inner
            .context
            .change_loa_async(self.inner.runtime.perm(), loa, on_done);
    }

    pub fn get_loa(&self) -> u8 {
        self.inner.context.get_loa()
    }

    pub fn cookie_set(&self, value: Arc<dyn Any + Send + Sync>) -> i32 {
        match self.inner.context.cookie_set(value) {
            Ok(()) => 0,
            Err(e) => e.raw_code(),
        }
    }

    pub fn cookie_get(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.context.cookie_get()
    }

    pub fn cookie_drop(&self) {
        self.inner.context.cookie_drop();
    }

    /// Identity of the client as a JSON object.
    pub fn get_client_info(&self) -> serde_json::Value {
        let ctx = &self.inner.context;
        let mut info = serde_json::Map::new();
        if let Some(cred) = ctx.cred() {
            info.insert("uid".into(), cred.uid().into());
            info.insert("gid".into(), cred.gid().into());
            info.insert("pid".into(), cred.pid().into());
            if let Some(label) = cred.label() {
                info.insert("label".into(), label.into());
            }
        }
        if let Some(uuid) = ctx.session_uuid() {
            info.insert("uuid".into(), uuid.into());
        }
        info.insert("LOA".into(), u64::from(ctx.get_loa()).into());
        serde_json::Value::Object(info)
    }

    // ------------------------------------------------------------------
    // Subcalls
    // ------------------------------------------------------------------

    /// Route a nested call through the local api set, inheriting this
    /// request's identity.
    pub fn subcall<F>(&self, api: &str, verb: &str, params: Vec<Data>, on_reply: F)
    where
        F: FnOnce(CallReply) + Send + 'static,
    {
        let sub = Request::new(
            &self.inner.runtime,
            api,
            verb,
            params,
            self.inner.context.subcontext(),
            ClosureReply::new(on_reply),
        );
        self.inner.runtime.process(sub);
    }

    /// Synchronous subcall. Only deferred completions (permission checks,
    /// queued jobs) are pumped; a subcall needing transport I/O from
    /// inside a callback replies `ABORTED` instead of blocking the loop.
    pub fn subcall_sync(&self, api: &str, verb: &str, params: Vec<Data>) -> CallReply {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        self.subcall(api, verb, params, move |reply| {
            *sink.lock().unwrap() = Some(reply);
        });
        for _ in 0..64 {
            if let Some(reply) = slot.lock().unwrap().take() {
                return reply;
            }
            self.inner.runtime.evmgr().flush_jobs();
        }
        CallReply {
            status: status::ABORTED,
            params: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Logging and user data
    // ------------------------------------------------------------------

    pub fn logmask(&self) -> LogMask {
        *self.inner.logmask.lock().unwrap()
    }

    pub(crate) fn set_logmask(&self, mask: LogMask) {
        *self.inner.logmask.lock().unwrap() = mask;
    }

    /// Request-scoped verbose output, gated by the API's log mask.
    pub fn vverbose(&self, level: LogLevel, args: std::fmt::Arguments<'_>) {
        let mask = self.logmask();
        if mask.wants(level) {
            let origin = format!("{}/{}", self.inner.api, self.inner.verb);
            vlog(mask, level, &origin, args);
        }
    }

    pub fn set_userdata(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.inner.userdata.lock().unwrap() = Some(value);
    }

    pub fn userdata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.userdata.lock().unwrap().clone()
    }
}
