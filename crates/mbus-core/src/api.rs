//! APIs: verb tables, control callbacks, event handlers, log mask.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mbus_data::Data;
use tracing::debug;

use crate::apiname::is_valid_api_name;
use crate::error::CoreError;
use crate::globmatch::{glob_match, name_cmp, name_eq};
use crate::logmask::LogMask;
use crate::verb::Verb;

/// Lifecycle notifications delivered to an API's control callback.
#[derive(Debug, Clone)]
pub enum Control {
    PreInit,
    Init,
    RootEntry,
    Exiting,
    /// A broadcast reached the API but no handler pattern matched.
    OrphanEvent(String),
}

pub type ControlHandler = Arc<dyn Fn(&Api, &Control) -> i32 + Send + Sync>;

/// Event handler attached with a glob pattern.
pub type EventHandler = Arc<dyn Fn(&Api, &str, &[Data]) + Send + Sync>;

struct DynTable {
    verbs: Vec<Arc<Verb>>,
    dirty: bool,
}

struct RunQueue {
    busy: bool,
    pending: VecDeque<Box<dyn FnOnce() + Send>>,
}

struct ApiInner {
    name: String,
    info: Option<String>,
    path: Option<String>,
    provided_classes: Vec<String>,
    required_classes: Vec<String>,
    static_verbs: Vec<Arc<Verb>>,
    dynamics: Mutex<DynTable>,
    sealed: AtomicBool,
    logmask: Mutex<LogMask>,
    noconcurrency: bool,
    control: Mutex<Option<ControlHandler>>,
    handlers: Mutex<Vec<(String, EventHandler)>>,
    userdata: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    queue: Mutex<RunQueue>,
}

/// A named collection of verbs and event handlers.
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

/// Builder of an [`Api`]; statically declared verbs are immutable once
/// built.
pub struct ApiBuilder {
    name: String,
    info: Option<String>,
    path: Option<String>,
    provided_classes: Vec<String>,
    required_classes: Vec<String>,
    verbs: Vec<Verb>,
    control: Option<ControlHandler>,
    noconcurrency: bool,
    logmask: LogMask,
}

impl ApiBuilder {
    pub fn new(name: &str) -> ApiBuilder {
        ApiBuilder {
            name: name.to_string(),
            info: None,
            path: None,
            provided_classes: Vec::new(),
            required_classes: Vec::new(),
            verbs: Vec::new(),
            control: None,
            noconcurrency: false,
            logmask: LogMask::default_mask(),
        }
    }

    pub fn info(mut self, info: &str) -> ApiBuilder {
        self.info = Some(info.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> ApiBuilder {
        self.path = Some(path.to_string());
        self
    }

    /// Declare a feature class this API implements.
    pub fn provides_class(mut self, class: &str) -> ApiBuilder {
        self.provided_classes.push(class.to_string());
        self
    }

    /// Declare a feature class this API needs from another one.
    pub fn requires_class(mut self, class: &str) -> ApiBuilder {
        self.required_classes.push(class.to_string());
        self
    }

    pub fn verb(mut self, verb: Verb) -> ApiBuilder {
        self.verbs.push(verb);
        self
    }

    pub fn control<H>(mut self, handler: H) -> ApiBuilder
    where
        H: Fn(&Api, &Control) -> i32 + Send + Sync + 'static,
    {
        self.control = Some(Arc::new(handler));
        self
    }

    /// Serialise every verb invocation of this API.
    pub fn noconcurrency(mut self) -> ApiBuilder {
        self.noconcurrency = true;
        self
    }

    pub fn logmask(mut self, mask: LogMask) -> ApiBuilder {
        self.logmask = mask;
        self
    }

    pub fn build(self) -> Result<Api, CoreError> {
        if !is_valid_api_name(&self.name) {
            return Err(CoreError::InvalidName(self.name));
        }
        Ok(Api {
            inner: Arc::new(ApiInner {
                name: self.name,
                info: self.info,
                path: self.path,
                provided_classes: self.provided_classes,
                required_classes: self.required_classes,
                static_verbs: self.verbs.into_iter().map(Arc::new).collect(),
                dynamics: Mutex::new(DynTable {
                    verbs: Vec::new(),
                    dirty: false,
                }),
                sealed: AtomicBool::new(false),
                logmask: Mutex::new(self.logmask),
                noconcurrency: self.noconcurrency,
                control: Mutex::new(self.control),
                handlers: Mutex::new(Vec::new()),
                userdata: Mutex::new(None),
                queue: Mutex::new(RunQueue {
                    busy: false,
                    pending: VecDeque::new(),
                }),
            }),
        })
    }
}

impl Api {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn info(&self) -> Option<&str> {
        self.inner.info.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    pub fn provides_class(&self, class: &str) -> bool {
        self.inner.provided_classes.iter().any(|c| c == class)
    }

    pub fn required_classes(&self) -> &[String] {
        &self.inner.required_classes
    }

    pub fn same(&self, other: &Api) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Freeze the API: no verb mutation afterwards.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::Acquire)
    }

    pub fn logmask(&self) -> LogMask {
        *self.inner.logmask.lock().unwrap()
    }

    pub fn set_logmask(&self, mask: LogMask) {
        *self.inner.logmask.lock().unwrap() = mask;
    }

    pub fn noconcurrency(&self) -> bool {
        self.inner.noconcurrency
    }

    pub fn set_userdata(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.inner.userdata.lock().unwrap() = Some(value);
    }

    pub fn userdata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.userdata.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    /// Add a dynamic verb; refused on sealed APIs and on a name already
    /// dynamically defined.
    pub fn add_verb(&self, verb: Verb) -> Result<(), CoreError> {
        if self.is_sealed() {
            return Err(CoreError::Sealed);
        }
        let mut table = self.inner.dynamics.lock().unwrap();
        if table.verbs.iter().any(|v| name_eq(&v.name, &verb.name)) {
            return Err(CoreError::VerbExists(verb.name));
        }
        table.verbs.push(Arc::new(verb));
        table.dirty = true;
        Ok(())
    }

    /// Remove a dynamic verb.
    pub fn del_verb(&self, name: &str) -> Result<(), CoreError> {
        if self.is_sealed() {
            return Err(CoreError::Sealed);
        }
        let mut table = self.inner.dynamics.lock().unwrap();
        let before = table.verbs.len();
        table.verbs.retain(|v| !name_eq(&v.name, name));
        if table.verbs.len() == before {
            return Err(CoreError::UnknownVerb(name.to_string()));
        }
        Ok(())
    }

    /// Resolve `name` to a verb: dynamic exact (binary search over the
    /// lazily sorted table), then dynamic globs in lexicographic order,
    /// then the static table (exact or glob), first match winning.
    pub fn find_verb(&self, name: &str) -> Option<Arc<Verb>> {
        {
            let mut table = self.inner.dynamics.lock().unwrap();
            if table.dirty {
                table.verbs.sort_by(|a, b| name_cmp(&a.name, &b.name));
                table.dirty = false;
            }
            if let Ok(found) = table
                .verbs
                .binary_search_by(|v| name_cmp(&v.name, name))
            {
                return Some(table.verbs[found].clone());
            }
            if let Some(found) = table
                .verbs
                .iter()
                .find(|v| v.glob && glob_match(&v.name, name))
            {
                return Some(found.clone());
            }
        }
        self.inner
            .static_verbs
            .iter()
            .find(|v| {
                if v.glob {
                    glob_match(&v.name, name)
                } else {
                    name_eq(&v.name, name)
                }
            })
            .cloned()
    }

    pub fn verb_names(&self) -> Vec<String> {
        let table = self.inner.dynamics.lock().unwrap();
        table
            .verbs
            .iter()
            .chain(self.inner.static_verbs.iter())
            .map(|v| v.name.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Control and events
    // ------------------------------------------------------------------

    pub fn set_control<H>(&self, handler: H)
    where
        H: Fn(&Api, &Control) -> i32 + Send + Sync + 'static,
    {
        *self.inner.control.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Invoke the control callback, when one is set.
    pub fn control(&self, event: &Control) -> i32 {
        let handler = self.inner.control.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(self, event),
            None => 0,
        }
    }

    pub fn has_control(&self) -> bool {
        self.inner.control.lock().unwrap().is_some()
    }

    /// Attach an event handler for the glob `pattern`.
    pub fn on_event<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(&Api, &str, &[Data]) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .push((pattern.to_string(), Arc::new(handler)));
    }

    pub fn has_event_handlers(&self) -> bool {
        !self.inner.handlers.lock().unwrap().is_empty()
    }

    /// Deliver a broadcast: run every handler whose pattern matches;
    /// returns whether at least one did.
    pub fn dispatch_broadcast(&self, event_name: &str, params: &[Data]) -> bool {
        let matching: Vec<EventHandler> = {
            let handlers = self.inner.handlers.lock().unwrap();
            handlers
                .iter()
                .filter(|(pattern, _)| glob_match(pattern, event_name))
                .map(|(_, h)| h.clone())
                .collect()
        };
        for handler in &matching {
            handler(self, event_name, params);
        }
        if matching.is_empty() {
            debug!(api = %self.inner.name, event = %event_name, "orphan broadcast");
            self.control(&Control::OrphanEvent(event_name.to_string()));
            false
        } else {
            true
        }
    }

    // ------------------------------------------------------------------
    // Serialisation group
    // ------------------------------------------------------------------

    /// Run `job`, serialising with the API's other invocations when it is
    /// marked `noconcurrency`; otherwise run it at once.
    pub fn enqueue(&self, job: Box<dyn FnOnce() + Send>) {
        if !self.inner.noconcurrency {
            return job();
        }
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.busy {
                queue.pending.push_back(job);
                return;
            }
            queue.busy = true;
        }
        job();
        loop {
            let next = {
                let mut queue = self.inner.queue.lock().unwrap();
                match queue.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        queue.busy = false;
                        break;
                    }
                }
            };
            next();
        }
    }
}
