//! Interned bearer tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

struct TokenInner {
    text: String,
    id: u16,
}

/// An interned bearer string with its small numeric id. Equal strings
/// obtained from the same cache share one entry.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl Token {
    pub fn text(&self) -> &str {
        &self.inner.text
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn same(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the bearer text.
        write!(f, "Token#{}", self.inner.id)
    }
}

/// The token intern table.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<TokenTable>,
}

#[derive(Default)]
struct TokenTable {
    by_text: HashMap<String, Weak<TokenInner>>,
    next_id: u16,
}

impl TokenCache {
    pub fn new() -> TokenCache {
        TokenCache::default()
    }

    /// Intern `text`: the same string always yields the same live entry.
    pub fn get(&self, text: &str) -> Token {
        let mut table = self.entries.lock().unwrap();
        if let Some(live) = table.by_text.get(text).and_then(Weak::upgrade) {
            return Token { inner: live };
        }
        table.by_text.retain(|_, weak| weak.strong_count() > 0);
        table.next_id = table.next_id.wrapping_add(1);
        let inner = Arc::new(TokenInner {
            text: text.to_string(),
            id: table.next_id,
        });
        table.by_text.insert(text.to_string(), Arc::downgrade(&inner));
        Token { inner }
    }
}
