//! The runtime aggregate: loop, type registry, identity, api set, events.
//!
//! Every component is reached through a [`Runtime`] handle passed by
//! reference; there is no process-wide state.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use mbus_auth::{
    AllowAll, Authority, Context, PermissionEngine, Session, SessionSet, TokenCache,
    DEFAULT_SESSION_TIMEOUT_SECS,
};
use mbus_data::{Data, TypeRegistry};
use mbus_evloop::{EvMgr, JobQueue};
use tracing::debug;

use crate::api::Api;
use crate::apiset::ApiSet;
use crate::auth::eval_auth;
use crate::error::status;
use crate::event::{Event, EventIds};
use crate::request::{CallReply, ClosureReply, Request};
use crate::verb::Verb;

struct RuntimeInner {
    evmgr: EvMgr,
    jobs: JobQueue,
    types: Arc<TypeRegistry>,
    sessions: Arc<SessionSet>,
    tokens: Arc<TokenCache>,
    perm: Arc<PermissionEngine>,
    apis: Arc<ApiSet>,
    events: Arc<EventIds>,
    /// Session shared by in-process callers.
    local_session: Session,
}

/// Shared handle on the binder runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Builder wiring the runtime's pluggable parts.
pub struct RuntimeBuilder {
    authority: Arc<dyn Authority>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            authority: Arc::new(AllowAll),
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn authority(mut self, authority: Arc<dyn Authority>) -> RuntimeBuilder {
        self.authority = authority;
        self
    }

    pub fn build(self) -> Result<Runtime, mbus_evloop::EvError> {
        let evmgr = EvMgr::new()?;
        let jobs = evmgr.jobs();
        let sessions = Arc::new(SessionSet::new());
        let (local_session, _) = sessions.get(None, DEFAULT_SESSION_TIMEOUT_SECS);
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                perm: Arc::new(PermissionEngine::new(self.authority, jobs.clone())),
                jobs,
                evmgr,
                types: TypeRegistry::new(),
                sessions,
                tokens: Arc::new(TokenCache::new()),
                apis: Arc::new(ApiSet::new()),
                events: Arc::new(EventIds::new()),
                local_session,
            }),
        })
    }
}

impl Runtime {
    /// Runtime with the default (allow-all) authority.
    pub fn new() -> Result<Runtime, mbus_evloop::EvError> {
        RuntimeBuilder::new().build()
    }

    pub fn evmgr(&self) -> &EvMgr {
        &self.inner.evmgr
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.inner.jobs
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.inner.types
    }

    pub fn sessions(&self) -> &Arc<SessionSet> {
        &self.inner.sessions
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.inner.tokens
    }

    pub fn perm(&self) -> &Arc<PermissionEngine> {
        &self.inner.perm
    }

    pub fn apis(&self) -> &Arc<ApiSet> {
        &self.inner.apis
    }

    pub fn event_ids(&self) -> &Arc<EventIds> {
        &self.inner.events
    }

    /// Create an event owned by `api`, named `api/name`.
    pub fn new_event(&self, api: &str, name: &str) -> Event {
        Event::new(&self.inner.events, &format!("{api}/{name}"))
    }

    /// Context for an in-process caller: shares the runtime-local session
    /// and is validated by construction.
    pub fn local_context(&self) -> Arc<Context> {
        Context::new_validated(self.inner.local_session.clone(), None)
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Deliver a named broadcast to every API: handlers whose pattern
    /// matches run; APIs listening but not matching get the orphan
    /// control notification.
    pub fn broadcast(&self, event_name: &str, params: &[Data]) {
        for api in self.inner.apis.apis() {
            if api.has_event_handlers() || api.has_control() {
                api.dispatch_broadcast(event_name, params);
            }
        }
    }

    // ------------------------------------------------------------------
    // Request pipeline
    // ------------------------------------------------------------------

    /// Route a request to its API and verb, run the session and
    /// authorization pre-checks, then invoke the verb callback.
    pub fn process(&self, req: Request) {
        let Some(api) = self.inner.apis.lookup(req.api()) else {
            debug!(api = %req.api(), "request for unknown api");
            req.reply_error(status::UNKNOWN_API, "unknown-api");
            return;
        };
        let Some(verb) = api.find_verb(req.verb()) else {
            debug!(api = %req.api(), verb = %req.verb(), "request for unknown verb");
            req.reply_error(status::UNKNOWN_VERB, "unknown-verb");
            return;
        };

        req.set_logmask(api.logmask());
        req.context().set_api_key(Some(api.name()));

        let invoke_req = req.clone();
        let invoke_api = api.clone();
        let invoke_verb = verb.clone();
        self.precheck(&req, &verb, move |granted| {
            if !granted {
                invoke_req.reply_error(status::DENIED, "denied");
                return;
            }
            let handler_req = invoke_req.clone();
            let handler = invoke_verb.handler.clone();
            invoke_api.enqueue(Box::new(move || handler(&handler_req)));
        });
    }

    /// Session/LOA/authorization pre-check; `done(true)` authorizes the
    /// invocation.
    fn precheck<F>(&self, req: &Request, verb: &Arc<Verb>, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let flags = verb.session;
        let auth = verb.auth.clone();
        if flags.is_anonymous() && auth.is_none() {
            return done(true);
        }

        let ctx = req.context();
        let engine = self.inner.perm.clone();
        let after_token = move |token_ok: bool| {
            if !token_ok {
                return done(false);
            }
            if flags.required_loa > 0 && !ctx.check_loa(flags.required_loa) {
                return done(false);
            }
            match auth {
                None => done(true),
                Some(auth) => eval_auth(&auth, &ctx, &engine, Box::new(done)),
            }
        };

        if flags.needs_token {
            let ctx = req.context();
            ctx.check_async(&self.inner.perm, move |status| after_token(status > 0));
        } else {
            after_token(true);
        }
    }

    // ------------------------------------------------------------------
    // Local calls
    // ------------------------------------------------------------------

    /// Issue a call from this process; `on_reply` fires once.
    pub fn call<F>(&self, api: &str, verb: &str, params: Vec<Data>, on_reply: F)
    where
        F: FnOnce(CallReply) + Send + 'static,
    {
        let req = Request::new(
            self,
            api,
            verb,
            params,
            self.local_context(),
            ClosureReply::new(on_reply),
        );
        self.process(req);
    }

    /// Blocking variant of [`Runtime::call`], driving the loop while the
    /// reply is pending. Must be called from outside loop callbacks.
    pub fn call_sync(
        &self,
        api: &str,
        verb: &str,
        params: Vec<Data>,
        timeout_ms: u32,
    ) -> CallReply {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        self.call(api, verb, params, move |reply| {
            *sink.lock().unwrap() = Some(reply);
        });
        let deadline = Instant::now() + std::time::Duration::from_millis(u64::from(timeout_ms));
        loop {
            if let Some(reply) = slot.lock().unwrap().take() {
                return reply;
            }
            if Instant::now() >= deadline {
                return CallReply {
                    status: -(libc::ETIMEDOUT),
                    params: Vec::new(),
                };
            }
            self.inner.evmgr.flush_jobs();
            if self.inner.evmgr.can_run() {
                let _ = self.inner.evmgr.run(10);
            }
        }
    }

    /// Register `api` in the runtime's call set, running its `PreInit`
    /// and `Init` controls.
    pub fn register_api(&self, api: Api) -> Result<(), crate::error::CoreError> {
        for class in api.required_classes() {
            if self.inner.apis.class_providers(class).is_empty() {
                tracing::warn!(
                    api = %api.name(),
                    class = %class,
                    "required class has no provider yet"
                );
            }
        }
        api.control(&crate::api::Control::PreInit);
        self.inner.apis.add(api.clone())?;
        api.control(&crate::api::Control::Init);
        Ok(())
    }
}
