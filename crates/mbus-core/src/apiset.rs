//! The named API registry with aliasing and the on-lack resolver.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::api::Api;
use crate::error::CoreError;

/// Resolver invoked the first time an unknown name is asked for. It may
/// install the API into the set and return it.
pub type OnLackResolver = Arc<dyn Fn(&ApiSet, &str) -> Option<Api> + Send + Sync>;

enum Slot {
    Api(Api),
    Alias(String),
}

/// Ordered registry of APIs.
pub struct ApiSet {
    entries: RwLock<BTreeMap<String, Slot>>,
    onlack: Mutex<Option<OnLackResolver>>,
    /// Names the resolver already failed on; asked at most once each.
    misses: Mutex<HashSet<String>>,
}

impl Default for ApiSet {
    fn default() -> Self {
        ApiSet::new()
    }
}

impl ApiSet {
    pub fn new() -> ApiSet {
        ApiSet {
            entries: RwLock::new(BTreeMap::new()),
            onlack: Mutex::new(None),
            misses: Mutex::new(HashSet::new()),
        }
    }

    /// Register `api` under its own name.
    pub fn add(&self, api: Api) -> Result<(), CoreError> {
        let mut entries = self.entries.write().unwrap();
        let name = api.name().to_string();
        if entries.contains_key(&name) {
            return Err(CoreError::ApiExists(name));
        }
        debug!(api = %name, "api registered");
        entries.insert(name, Slot::Api(api));
        Ok(())
    }

    /// Register `alias` as another name of `target`.
    pub fn add_alias(&self, alias: &str, target: &str) -> Result<(), CoreError> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(alias) {
            return Err(CoreError::ApiExists(alias.to_string()));
        }
        entries.insert(alias.to_string(), Slot::Alias(target.to_string()));
        Ok(())
    }

    /// Remove a name (api or alias).
    pub fn remove(&self, name: &str) -> Result<(), CoreError> {
        let mut entries = self.entries.write().unwrap();
        entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::UnknownApi(name.to_string()))
    }

    /// Install the on-lack resolver.
    pub fn set_onlack(&self, resolver: OnLackResolver) {
        *self.onlack.lock().unwrap() = Some(resolver);
        // A fresh resolver deserves a fresh chance on old misses.
        self.misses.lock().unwrap().clear();
    }

    fn direct_lookup(&self, name: &str) -> Option<Api> {
        let entries = self.entries.read().unwrap();
        let mut key = name;
        // Bounded alias chain walk.
        for _ in 0..8 {
            match entries.get(key) {
                Some(Slot::Api(api)) => return Some(api.clone()),
                Some(Slot::Alias(target)) => key = target,
                None => return None,
            }
        }
        None
    }

    /// Find `name`, consulting the on-lack resolver at most once per
    /// unknown name.
    pub fn lookup(&self, name: &str) -> Option<Api> {
        if let Some(api) = self.direct_lookup(name) {
            return Some(api);
        }
        let resolver = {
            if self.misses.lock().unwrap().contains(name) {
                return None;
            }
            self.onlack.lock().unwrap().clone()
        };
        let resolver = resolver?;
        // Record the attempt first: the resolver is asked exactly once
        // for a given name, whatever it answers.
        self.misses.lock().unwrap().insert(name.to_string());
        debug!(api = %name, "asking on-lack resolver");
        if let Some(api) = resolver(self, name) {
            return Some(api);
        }
        self.direct_lookup(name)
    }

    /// All registered names (aliases included), in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    /// APIs implementing a feature class.
    pub fn class_providers(&self, class: &str) -> Vec<Api> {
        self.apis()
            .into_iter()
            .filter(|api| api.provides_class(class))
            .collect()
    }

    /// All distinct APIs, in name order.
    pub fn apis(&self) -> Vec<Api> {
        let entries = self.entries.read().unwrap();
        entries
            .values()
            .filter_map(|slot| match slot {
                Slot::Api(api) => Some(api.clone()),
                Slot::Alias(_) => None,
            })
            .collect()
    }
}
