//! The sockspec URI grammar.
//!
//! `[ws+|tls+|mtls+][scheme:]rest[?arg=value&…]` with schemes `tcp`
//! (default), `unix` (path or abstract `@name`), `sd` (inherited fd),
//! `l4vsock` and `char`. The client-side aliases `ws://`, `wss://`,
//! `http://` and `https://` are accepted and rewritten. The API names
//! served by a socket come from the last `/` segment (comma-separated
//! for several) or from the `as-api` query argument.

use crate::error::SockError;

/// Transport composition selected by the URI prefixes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrapFlags {
    pub tls: bool,
    pub mutual: bool,
    pub websocket: bool,
}

/// Address family of a sockspec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockScheme {
    Tcp,
    Unix,
    Systemd,
    Vsock,
    Char,
}

/// A parsed sockspec URI.
#[derive(Debug, Clone)]
pub struct SockSpec {
    pub scheme: SockScheme,
    /// Everything between the scheme and the query.
    pub rest: String,
    pub query: Vec<(String, String)>,
    pub flags: WrapFlags,
}

fn split_query(uri: &str) -> (&str, Vec<(String, String)>) {
    match uri.split_once('?') {
        None => (uri, Vec::new()),
        Some((head, tail)) => {
            let args = tail
                .split('&')
                .filter(|s| !s.is_empty())
                .map(|arg| match arg.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (arg.to_string(), String::new()),
                })
                .collect();
            (head, args)
        }
    }
}

impl SockSpec {
    /// Parse a sockspec URI.
    pub fn parse(uri: &str) -> Result<SockSpec, SockError> {
        let mut flags = WrapFlags::default();
        let mut rest = uri;

        // Client-side aliases of the web world.
        for (alias, ws, tls) in [
            ("wss://", true, true),
            ("ws://", true, false),
            ("https://", false, true),
            ("http://", false, false),
        ] {
            if let Some(tail) = rest.strip_prefix(alias) {
                flags.websocket = ws;
                flags.tls = tls;
                rest = tail;
                let (head, query) = split_query(rest);
                return Ok(SockSpec {
                    scheme: SockScheme::Tcp,
                    rest: head.to_string(),
                    query,
                    flags,
                });
            }
        }

        // Composition prefixes; tls+ and ws+ are mutually exclusive.
        loop {
            if let Some(tail) = rest.strip_prefix("ws+") {
                if flags.tls {
                    return Err(SockError::BadUri("ws+ combined with tls+"));
                }
                flags.websocket = true;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("tls+") {
                if flags.websocket {
                    return Err(SockError::BadUri("tls+ combined with ws+"));
                }
                flags.tls = true;
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("mtls+") {
                if flags.websocket {
                    return Err(SockError::BadUri("mtls+ combined with ws+"));
                }
                flags.tls = true;
                flags.mutual = true;
                rest = tail;
            } else {
                break;
            }
        }

        let (scheme, tail) = if let Some(tail) = rest.strip_prefix("tcp:") {
            (SockScheme::Tcp, tail)
        } else if let Some(tail) = rest.strip_prefix("unix:") {
            (SockScheme::Unix, tail)
        } else if let Some(tail) = rest.strip_prefix("sd:") {
            (SockScheme::Systemd, tail)
        } else if let Some(tail) = rest.strip_prefix("l4vsock:") {
            (SockScheme::Vsock, tail)
        } else if let Some(tail) = rest.strip_prefix("char:") {
            (SockScheme::Char, tail)
        } else {
            (SockScheme::Tcp, rest)
        };

        let (head, query) = split_query(tail);
        if head.is_empty() {
            return Err(SockError::BadUri("empty address"));
        }
        Ok(SockSpec {
            scheme,
            rest: head.to_string(),
            query,
            flags,
        })
    }

    /// First value of a query argument.
    pub fn query_arg(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The API names carried by the URI: `as-api` when present, else the
    /// segment after the last `/` (or the bare name of `unix:@name` and
    /// `sd:name`), split on commas when `multi`.
    pub fn api_names(&self, multi: bool) -> Result<Vec<String>, SockError> {
        let raw = match self.query_arg("as-api") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let tail = match self.rest.rsplit_once('/') {
                    Some((_, tail)) => tail,
                    None => match self.scheme {
                        SockScheme::Unix => self.rest.strip_prefix('@').unwrap_or(&self.rest),
                        SockScheme::Systemd => &self.rest,
                        _ => return Err(SockError::NoApiName),
                    },
                };
                if tail.is_empty() {
                    return Err(SockError::NoApiName);
                }
                tail.to_string()
            }
        };
        let names: Vec<String> = raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() || (!multi && names.len() > 1) {
            return Err(SockError::NoApiName);
        }
        Ok(names)
    }

    /// The single API name of the URI.
    pub fn api_name(&self) -> Result<String, SockError> {
        Ok(self.api_names(false)?.remove(0))
    }
}
