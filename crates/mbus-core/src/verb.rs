//! Verb descriptors.

use std::sync::Arc;

use crate::auth::Auth;
use crate::request::Request;

/// Callback bound to a verb.
pub type VerbHandler = Arc<dyn Fn(&Request) + Send + Sync>;

/// Session requirements of a verb: a minimum level of assurance and
/// whether an authenticated session (valid token) is required.
/// LOA 0 with no token requirement is anonymous access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub required_loa: u8,
    pub needs_token: bool,
}

impl SessionFlags {
    pub const ANONYMOUS: SessionFlags = SessionFlags {
        required_loa: 0,
        needs_token: false,
    };

    pub fn with_loa(loa: u8) -> SessionFlags {
        SessionFlags {
            required_loa: loa,
            needs_token: false,
        }
    }

    pub fn checked() -> SessionFlags {
        SessionFlags {
            required_loa: 0,
            needs_token: true,
        }
    }

    pub fn is_anonymous(self) -> bool {
        self.required_loa == 0 && !self.needs_token
    }

    /// Wire form: low 3 bits carry the LOA, bit 3 the token requirement.
    pub fn to_raw(self) -> u8 {
        (self.required_loa & 7) | (u8::from(self.needs_token) << 3)
    }

    pub fn from_raw(raw: u8) -> SessionFlags {
        SessionFlags {
            required_loa: raw & 7,
            needs_token: raw & 8 != 0,
        }
    }
}

/// One verb of an API.
pub struct Verb {
    pub name: String,
    pub info: Option<String>,
    pub handler: VerbHandler,
    pub auth: Option<Arc<Auth>>,
    pub session: SessionFlags,
    pub glob: bool,
}

impl Verb {
    pub fn new<H>(name: &str, handler: H) -> Verb
    where
        H: Fn(&Request) + Send + Sync + 'static,
    {
        Verb {
            name: name.to_string(),
            info: None,
            handler: Arc::new(handler),
            auth: None,
            session: SessionFlags::ANONYMOUS,
            glob: false,
        }
    }

    pub fn with_info(mut self, info: &str) -> Verb {
        self.info = Some(info.to_string());
        self
    }

    pub fn with_auth(mut self, auth: Auth) -> Verb {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn with_session(mut self, session: SessionFlags) -> Verb {
        self.session = session;
        self
    }

    /// Mark the name as a glob pattern.
    pub fn with_glob(mut self) -> Verb {
        self.glob = true;
        self
    }
}
