//! The per-request identity context: session + token + credentials, with
//! the memoized validation flags and the on-behalf machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::cred::Cred;
use crate::error::AuthError;
use crate::perm::{PermQuery, PermissionEngine, PERM_ON_BEHALF, PERM_TOKEN_VALID};
use crate::session::{Session, SessionSet};
use crate::token::Token;
use crate::LOA_MAX;

/// Identity context of one request. Subcall contexts keep a link to their
/// parent and inherit its validation verdict.
pub struct Context {
    session: Mutex<Option<Session>>,
    token: Mutex<Option<Token>>,
    cred: Mutex<Option<Cred>>,
    /// Cookie/LOA namespace of the api currently serving the request.
    api_key: Mutex<Option<String>>,
    parent: Option<Arc<Context>>,
    validated: AtomicBool,
    invalidated: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    created: AtomicBool,
}

impl Context {
    /// Context over an existing session.
    pub fn new(session: Session, token: Option<Token>) -> Arc<Context> {
        Arc::new(Context {
            session: Mutex::new(Some(session)),
            token: Mutex::new(token),
            cred: Mutex::new(None),
            api_key: Mutex::new(None),
            parent: None,
            validated: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created: AtomicBool::new(false),
        })
    }

    /// Context connected to the session of `uuid`, creating it on need.
    pub fn connect(
        sessions: &SessionSet,
        uuid: Option<&str>,
        timeout_secs: u32,
        token: Option<Token>,
    ) -> Arc<Context> {
        let (session, created) = sessions.get(uuid, timeout_secs);
        let ctx = Context::new(session, token);
        ctx.created.store(created, Ordering::Release);
        ctx
    }

    /// Pre-validated variant (local callers trusted by construction).
    pub fn new_validated(session: Session, token: Option<Token>) -> Arc<Context> {
        let ctx = Context::new(session, token);
        ctx.validated.store(true, Ordering::Release);
        ctx
    }

    /// Sub-context for a subcall: shares identity, remembers the parent.
    pub fn subcontext(self: &Arc<Context>) -> Arc<Context> {
        Arc::new(Context {
            session: Mutex::new(self.session()),
            token: Mutex::new(self.token()),
            cred: Mutex::new(self.cred()),
            api_key: Mutex::new(None),
            parent: Some(self.clone()),
            validated: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    pub fn session_uuid(&self) -> Option<String> {
        self.session().map(|s| s.uuid().to_string())
    }

    pub fn token(&self) -> Option<Token> {
        self.token.lock().unwrap().clone()
    }

    pub fn cred(&self) -> Option<Cred> {
        self.cred.lock().unwrap().clone()
    }

    pub fn was_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    pub fn change_token(&self, token: Option<Token>) {
        *self.token.lock().unwrap() = token;
    }

    pub fn change_cred(&self, cred: Option<Cred>) {
        *self.cred.lock().unwrap() = cred;
    }

    pub fn set_api_key(&self, api_key: Option<&str>) {
        *self.api_key.lock().unwrap() = api_key.map(str::to_string);
    }

    fn api_key(&self) -> String {
        self.api_key.lock().unwrap().clone().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn perm_query(&self, permission: &str) -> PermQuery {
        PermQuery {
            cred: self.cred(),
            token: self.token(),
            session_uuid: self.session_uuid(),
            permission: permission.to_string(),
        }
    }

    /// Is this context authenticated? The verdict is memoized in the
    /// `validated`/`invalidated` flags; the first call asks the engine for
    /// the token-validity permission. `on_done` may run inline on a
    /// memoized verdict.
    pub fn check_async<F>(self: &Arc<Context>, engine: &PermissionEngine, on_done: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        self.check_async_boxed(engine, Box::new(on_done));
    }

    fn check_async_boxed(
        self: &Arc<Context>,
        engine: &PermissionEngine,
        on_done: Box<dyn FnOnce(i32) + Send + 'static>,
    ) {
        if self.validated.load(Ordering::Acquire) {
            return on_done(1);
        }
        if self.invalidated.load(Ordering::Acquire) {
            return on_done(0);
        }
        if let Some(parent) = &self.parent {
            let me = self.clone();
            return parent.check_async_boxed(
                engine,
                Box::new(move |status| {
                    me.record_verdict(status);
                    on_done(status);
                }),
            );
        }
        let me = self.clone();
        engine.check(self.perm_query(PERM_TOKEN_VALID), move |status| {
            me.record_verdict(status);
            on_done(status);
        });
    }

    fn record_verdict(&self, status: i32) {
        if status > 0 {
            self.validated.store(true, Ordering::Release);
        } else {
            self.invalidated.store(true, Ordering::Release);
        }
    }

    /// Check an arbitrary permission for this context.
    pub fn has_permission_async<F>(&self, engine: &PermissionEngine, permission: &str, on_done: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        engine.check(self.perm_query(permission), on_done);
    }

    // ------------------------------------------------------------------
    // On-behalf credentials
    // ------------------------------------------------------------------

    /// Serialised credentials, for forwarding a call on behalf of the
    /// original client.
    pub fn on_behalf_export(&self) -> Option<String> {
        self.cred().map(|c| c.export())
    }

    /// Re-key the context with imported credentials, if the current
    /// identity holds the on-behalf permission.
    pub fn on_behalf_import_async<F>(
        self: &Arc<Context>,
        engine: &PermissionEngine,
        exported: &str,
        on_done: F,
    ) where
        F: FnOnce(i32) + Send + 'static,
    {
        if exported.is_empty() {
            return on_done(0);
        }
        let me = self.clone();
        let exported = exported.to_string();
        engine.check(self.perm_query(PERM_ON_BEHALF), move |status| {
            if status > 0 {
                match Cred::import(&exported) {
                    Ok(cred) => {
                        me.change_cred(Some(cred));
                        on_done(0);
                    }
                    Err(e) => {
                        error!(error = %e, "cannot import on-behalf credentials");
                        on_done(e.raw_code());
                    }
                }
            } else {
                error!("on-behalf credentials refused");
                on_done(-libc::EPERM);
            }
        });
    }

    // ------------------------------------------------------------------
    // Level of assurance
    // ------------------------------------------------------------------

    /// Set the LOA without any check.
    pub fn force_loa(&self, loa: u8) -> i32 {
        match self.session() {
            Some(session) => match session.set_loa(&self.api_key(), loa) {
                Ok(()) => 0,
                Err(e) => e.raw_code(),
            },
            None => -libc::ESTALE,
        }
    }

    /// Set the LOA once the context proves authenticated.
    pub fn change_loa_async<F>(self: &Arc<Context>, engine: &PermissionEngine, loa: u8, on_done: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        if loa > LOA_MAX {
            return on_done(AuthError::LoaOutOfRange.raw_code());
        }
        if self.validated.load(Ordering::Acquire) {
            return on_done(self.force_loa(loa));
        }
        let me = self.clone();
        self.check_async(engine, move |status| {
            if status > 0 {
                on_done(me.force_loa(loa));
            } else {
                on_done(-libc::EPERM);
            }
        });
    }

    pub fn get_loa(&self) -> u8 {
        self.session()
            .map_or(0, |session| session.get_loa(&self.api_key()))
    }

    pub fn check_loa(&self, required: u8) -> bool {
        self.get_loa() >= required
    }

    // ------------------------------------------------------------------
    // Cookies
    // ------------------------------------------------------------------

    pub fn cookie_set(
        &self,
        value: Arc<dyn std::any::Any + Send + Sync>,
    ) -> Result<(), AuthError> {
        match self.session() {
            Some(session) => session.cookie_set(&self.api_key(), value),
            None => Err(AuthError::SessionClosed),
        }
    }

    pub fn cookie_get(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.session()?.cookie_get(&self.api_key())
    }

    pub fn cookie_drop(&self) {
        if let Some(session) = self.session() {
            session.cookie_drop(&self.api_key());
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Request the session closure at the end of the request.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Detach from the session, honouring a pending closure request.
    pub fn disconnect(&self) {
        let is_root = self.parent.is_none();
        if is_root
            && self.closing.load(Ordering::Acquire)
            && !self.closed.swap(true, Ordering::AcqRel)
        {
            if let Some(session) = self.session() {
                debug!(uuid = %session.uuid(), "closing session at request end");
                session.close();
            }
        }
        *self.session.lock().unwrap() = None;
        *self.cred.lock().unwrap() = None;
        *self.token.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perm::{AllowAll, Authority, Decision};

    struct DenyAll;
    impl Authority for DenyAll {
        fn check(&self, _query: &PermQuery, decision: Decision) {
            decision.complete(0);
        }
    }

    fn drive(mgr: &mbus_evloop::EvMgr) {
        for _ in 0..4 {
            let _ = mgr.run(10);
        }
    }

    fn harness(authority: Arc<dyn Authority>) -> (mbus_evloop::EvMgr, PermissionEngine, SessionSet)
    {
        let mgr = mbus_evloop::EvMgr::new().unwrap();
        let engine = PermissionEngine::new(authority, mgr.jobs());
        (mgr, engine, SessionSet::new())
    }

    #[test]
    fn verdict_is_memoized_on_the_context() {
        let (mgr, engine, sessions) = harness(Arc::new(AllowAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.check_async(&engine, move |s| sink.lock().unwrap().push(s));
        drive(&mgr);
        assert!(ctx.is_validated());
        // Second check completes inline from the flag.
        let sink = seen.clone();
        ctx.check_async(&engine, move |s| sink.lock().unwrap().push(s));
        assert_eq!(&*seen.lock().unwrap(), &[1, 1]);
    }

    #[test]
    fn subcontext_inherits_parent_verdict() {
        let (mgr, engine, sessions) = harness(Arc::new(DenyAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        let sub = ctx.subcontext();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sub.check_async(&engine, move |s| sink.lock().unwrap().push(s));
        drive(&mgr);
        assert_eq!(&*seen.lock().unwrap(), &[0]);
        assert!(!sub.is_validated());
    }

    #[test]
    fn loa_is_scoped_by_api_key() {
        let (mgr, engine, sessions) = harness(Arc::new(AllowAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        ctx.set_api_key(Some("api-a"));
        let done = Arc::new(Mutex::new(None));
        let sink = done.clone();
        ctx.change_loa_async(&engine, 3, move |s| *sink.lock().unwrap() = Some(s));
        drive(&mgr);
        assert_eq!(*done.lock().unwrap(), Some(0));
        assert_eq!(ctx.get_loa(), 3);
        ctx.set_api_key(Some("api-b"));
        assert_eq!(ctx.get_loa(), 0);
    }

    #[test]
    fn out_of_range_loa_is_refused() {
        let (_mgr, engine, sessions) = harness(Arc::new(AllowAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        let done = Arc::new(Mutex::new(None));
        let sink = done.clone();
        ctx.change_loa_async(&engine, 8, move |s| *sink.lock().unwrap() = Some(s));
        assert_eq!(*done.lock().unwrap(), Some(-libc::EINVAL));
    }

    #[test]
    fn on_behalf_requires_the_permission() {
        let (mgr, engine, sessions) = harness(Arc::new(DenyAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        let done = Arc::new(Mutex::new(None));
        let sink = done.clone();
        ctx.on_behalf_import_async(&engine, "1:2:3-peer", move |s| {
            *sink.lock().unwrap() = Some(s);
        });
        drive(&mgr);
        assert_eq!(*done.lock().unwrap(), Some(-libc::EPERM));
        assert!(ctx.cred().is_none());
    }

    #[test]
    fn on_behalf_rekeys_the_context() {
        let (mgr, engine, sessions) = harness(Arc::new(AllowAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        let done = Arc::new(Mutex::new(None));
        let sink = done.clone();
        ctx.on_behalf_import_async(&engine, "a:14:3e8-warden", move |s| {
            *sink.lock().unwrap() = Some(s);
        });
        drive(&mgr);
        assert_eq!(*done.lock().unwrap(), Some(0));
        let cred = ctx.cred().unwrap();
        assert_eq!(cred.uid(), 10);
        assert_eq!(cred.gid(), 20);
        assert_eq!(cred.label(), Some("warden"));
    }

    #[test]
    fn closing_context_closes_the_session_once() {
        let (_mgr, _engine, sessions) = harness(Arc::new(AllowAll));
        let ctx = Context::connect(&sessions, Some("u"), 60, None);
        let session = ctx.session().unwrap();
        ctx.close();
        ctx.disconnect();
        assert!(session.is_closed());
        assert!(sessions.lookup("u").is_none());
    }
}
