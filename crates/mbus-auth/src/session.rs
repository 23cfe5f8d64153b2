//! Sessions: uuid-keyed contexts holding levels of assurance and cookies.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;
use crate::LOA_MAX;

/// Default lifetime of a session without activity.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u32 = 32 * 60;

type CookieValue = Arc<dyn Any + Send + Sync>;

struct SessionState {
    expiry: Instant,
    timeout: Duration,
    closed: bool,
    /// LOA per api cookie key.
    loa: HashMap<String, u8>,
    /// Cookie per api cookie key; the value's own drop is its destructor.
    cookies: HashMap<String, CookieValue>,
}

struct SessionInner {
    uuid: String,
    state: Mutex<SessionState>,
}

/// Shared handle on one session. The session stays alive while any clone
/// exists; the [`SessionSet`] forgets it once expired or closed.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn new(uuid: String, timeout: Duration) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                uuid,
                state: Mutex::new(SessionState {
                    expiry: Instant::now() + timeout,
                    timeout,
                    closed: false,
                    loa: HashMap::new(),
                    cookies: HashMap::new(),
                }),
            }),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Push the expiry one timeout away; done on every use.
    pub fn touch(&self) {
        let mut st = self.inner.state.lock().unwrap();
        let timeout = st.timeout;
        st.expiry = Instant::now() + timeout;
    }

    pub fn is_expired(&self) -> bool {
        let st = self.inner.state.lock().unwrap();
        st.closed || st.expiry <= Instant::now()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Close the session: cookies are dropped (running their destructors),
    /// levels of assurance reset, further use refused.
    pub fn close(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.closed = true;
        st.loa.clear();
        st.cookies.clear();
        debug!(uuid = %self.inner.uuid, "session closed");
    }

    /// Record a level of assurance for `api_key`.
    pub fn set_loa(&self, api_key: &str, loa: u8) -> Result<(), AuthError> {
        if loa > LOA_MAX {
            return Err(AuthError::LoaOutOfRange);
        }
        let mut st = self.inner.state.lock().unwrap();
        if st.closed {
            return Err(AuthError::SessionClosed);
        }
        if loa == 0 {
            st.loa.remove(api_key);
        } else {
            st.loa.insert(api_key.to_string(), loa);
        }
        Ok(())
    }

    pub fn get_loa(&self, api_key: &str) -> u8 {
        self.inner
            .state
            .lock()
            .unwrap()
            .loa
            .get(api_key)
            .copied()
            .unwrap_or(0)
    }

    /// Store (or replace) the cookie of `api_key`. The previous value is
    /// dropped, running its destructor.
    pub fn cookie_set(&self, api_key: &str, value: CookieValue) -> Result<(), AuthError> {
        let mut st = self.inner.state.lock().unwrap();
        if st.closed {
            return Err(AuthError::SessionClosed);
        }
        st.cookies.insert(api_key.to_string(), value);
        Ok(())
    }

    pub fn cookie_get(&self, api_key: &str) -> Option<CookieValue> {
        self.inner.state.lock().unwrap().cookies.get(api_key).cloned()
    }

    /// Fetch the cookie, creating it with `make` when absent.
    pub fn cookie_get_or_make<F>(&self, api_key: &str, make: F) -> Result<CookieValue, AuthError>
    where
        F: FnOnce() -> CookieValue,
    {
        let mut st = self.inner.state.lock().unwrap();
        if st.closed {
            return Err(AuthError::SessionClosed);
        }
        Ok(st
            .cookies
            .entry(api_key.to_string())
            .or_insert_with(make)
            .clone())
    }

    pub fn cookie_drop(&self, api_key: &str) {
        self.inner.state.lock().unwrap().cookies.remove(api_key);
    }
}

/// The set of live sessions, keyed by uuid.
pub struct SessionSet {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionSet {
    fn default() -> Self {
        SessionSet::new()
    }
}

impl SessionSet {
    pub fn new() -> SessionSet {
        SessionSet {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the session of `uuid` (a fresh uuid when `None`).
    /// Returns the session and whether it was created.
    pub fn get(&self, uuid: Option<&str>, timeout_secs: u32) -> (Session, bool) {
        let timeout = Duration::from_secs(u64::from(timeout_secs));
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, s| !s.is_expired());
        match uuid {
            Some(uuid) => {
                if let Some(live) = sessions.get(uuid) {
                    live.touch();
                    return (live.clone(), false);
                }
                let session = Session::new(uuid.to_string(), timeout);
                sessions.insert(uuid.to_string(), session.clone());
                (session, true)
            }
            None => {
                let uuid = Uuid::new_v4().to_string();
                let session = Session::new(uuid.clone(), timeout);
                sessions.insert(uuid, session.clone());
                (session, true)
            }
        }
    }

    /// Find an existing, live session.
    pub fn lookup(&self, uuid: &str) -> Option<Session> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(uuid).filter(|s| !s.is_expired()).cloned()
    }

    pub fn count(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, s| !s.is_expired());
        sessions.len()
    }
}
