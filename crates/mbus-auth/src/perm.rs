//! Asynchronous permission checks with per-session memoization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mbus_evloop::JobQueue;
use tracing::warn;

use crate::cred::Cred;
use crate::token::Token;

/// Permission proving that the request's token is valid.
pub const PERM_TOKEN_VALID: &str = "urn:AGL:token:valid";

/// Permission guarding credential substitution.
pub const PERM_ON_BEHALF: &str = "urn:AGL:permission:*:partner:on-behalf-credentials";

/// One permission question put to the authority.
pub struct PermQuery {
    pub cred: Option<Cred>,
    pub token: Option<Token>,
    pub session_uuid: Option<String>,
    pub permission: String,
}

/// One-shot answer channel handed to the authority. Status `1` grants,
/// `0` denies, negative values report an authority failure (treated as a
/// denial by callers).
pub struct Decision {
    deliver: Box<dyn FnOnce(i32) + Send>,
}

impl Decision {
    pub fn new<F: FnOnce(i32) + Send + 'static>(deliver: F) -> Decision {
        Decision {
            deliver: Box::new(deliver),
        }
    }

    pub fn complete(self, status: i32) {
        (self.deliver)(status);
    }
}

/// The pluggable deciding back-end. May answer synchronously from inside
/// `check` or keep the [`Decision`] for later.
pub trait Authority: Send + Sync {
    fn check(&self, query: &PermQuery, decision: Decision);
}

/// Authority granting everything; the default of standalone hosts.
pub struct AllowAll;

impl Authority for AllowAll {
    fn check(&self, _query: &PermQuery, decision: Decision) {
        decision.complete(1);
    }
}

type VerdictCache = Arc<Mutex<HashMap<(String, String), i32>>>;

/// The engine: caches (session, permission) verdicts and routes
/// completions through the loop's job queue so callers always get their
/// callback from the loop thread.
pub struct PermissionEngine {
    authority: Arc<dyn Authority>,
    jobs: JobQueue,
    cache: VerdictCache,
}

impl PermissionEngine {
    pub fn new(authority: Arc<dyn Authority>, jobs: JobQueue) -> PermissionEngine {
        PermissionEngine {
            authority,
            jobs,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ask whether `query` is granted; `on_done` runs on the loop thread.
    pub fn check<F>(&self, query: PermQuery, on_done: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        // Verdicts are scoped to the identity: same session asked with
        // other credentials (on-behalf) must miss the cache.
        let key = query.session_uuid.as_ref().map(|uuid| {
            let cred = query.cred.as_ref().map(Cred::export).unwrap_or_default();
            (format!("{uuid}|{cred}"), query.permission.clone())
        });

        if let Some(key) = &key {
            if let Some(&verdict) = self.cache.lock().unwrap().get(key) {
                self.jobs.post(move || on_done(verdict));
                return;
            }
        }

        let jobs = self.jobs.clone();
        let cache = self.cache.clone();
        let permission = query.permission.clone();
        let decision = Decision::new(move |status| {
            if status < 0 {
                warn!(permission = %permission, status, "permission authority failure");
            }
            if let Some(key) = key {
                // Failures are not memoized: the authority may recover.
                if status >= 0 {
                    cache.lock().unwrap().insert(key, status);
                }
            }
            jobs.post(move || on_done(status));
        });
        self.authority.check(&query, decision);
    }

    /// Drop every memoized verdict.
    pub fn flush_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}
