//! Reference-counted typed values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde_json::Value;

use crate::error::DataError;
use crate::registry::TypeId;

/// What a value holds: raw bytes (owned or borrowed for the whole program)
/// or a parsed JSON tree for the `jsonc` type.
pub enum Payload {
    Bytes(Box<[u8]>),
    Static(&'static [u8]),
    Json(Value),
}

impl Payload {
    /// Byte view, when the payload is bytes.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Static(s) => Some(s),
            Payload::Json(_) => None,
        }
    }

    /// JSON tree view, when the payload is a tree.
    pub fn json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Static(s) => s.len(),
            Payload::Json(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Writers get owned bytes: borrowed static payloads are copied first.
fn reown_static(payload: &mut Payload) {
    let bytes = match payload {
        Payload::Static(s) => *s,
        _ => return,
    };
    *payload = Payload::Bytes(bytes.into());
}

pub(crate) struct DataInner {
    type_id: TypeId,
    payload: Arc<RwLock<Payload>>,
    constant: AtomicBool,
    volatile_: AtomicBool,
    disposer: Mutex<Option<Disposer>>,
    /// Values this one depends on; they outlive it.
    deps: Mutex<Vec<Data>>,
    /// Converted forms, invalidated by `notify_changed`.
    cache: Mutex<Vec<(TypeId, Weak<DataInner>)>>,
    pub(crate) opaque_id: Mutex<Option<u16>>,
}

impl Drop for DataInner {
    fn drop(&mut self) {
        if let Some(dispose) = self.disposer.lock().unwrap().take() {
            dispose();
        }
    }
}

/// A typed, reference-counted value. Clones share the same payload; the
/// last clone to drop runs the disposer, after any dependent value is gone
/// (dependents hold strong references to what they depend on).
#[derive(Clone)]
pub struct Data {
    inner: Arc<DataInner>,
}

/// Shared read access to the payload.
pub struct ReadGuard<'a> {
    guard: RwLockReadGuard<'a, Payload>,
}

impl std::ops::Deref for ReadGuard<'_> {
    type Target = Payload;
    fn deref(&self) -> &Payload {
        &self.guard
    }
}

/// Exclusive write access to the payload.
pub struct WriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Payload>,
}

impl std::ops::Deref for WriteGuard<'_> {
    type Target = Payload;
    fn deref(&self) -> &Payload {
        &self.guard
    }
}

impl WriteGuard<'_> {
    /// Mutable byte view; `None` when the payload is a JSON tree.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut *self.guard {
            Payload::Bytes(b) => Some(b),
            // write() re-owned static payloads beforehand
            Payload::Static(_) => None,
            Payload::Json(_) => None,
        }
    }

    /// Replace the whole payload.
    pub fn set(&mut self, payload: Payload) {
        *self.guard = payload;
    }

    /// Mutable JSON view; `None` when the payload is bytes.
    pub fn json_mut(&mut self) -> Option<&mut Value> {
        match &mut *self.guard {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl Data {
    fn build(type_id: TypeId, payload: Payload, constant: bool, disposer: Option<Disposer>) -> Data {
        Data {
            inner: Arc::new(DataInner {
                type_id,
                payload: Arc::new(RwLock::new(payload)),
                constant: AtomicBool::new(constant),
                volatile_: AtomicBool::new(false),
                disposer: Mutex::new(disposer),
                deps: Mutex::new(Vec::new()),
                cache: Mutex::new(Vec::new()),
                opaque_id: Mutex::new(None),
            }),
        }
    }

    /// Wrap an owned buffer; `disposer` runs once, on last release.
    pub fn new_raw<B>(type_id: TypeId, bytes: B, disposer: Option<Disposer>) -> Data
    where
        B: Into<Box<[u8]>>,
    {
        Data::build(type_id, Payload::Bytes(bytes.into()), false, disposer)
    }

    /// Allocate a zeroed buffer of `len` bytes.
    pub fn new_alloc(type_id: TypeId, len: usize) -> Data {
        Data::build(type_id, Payload::Bytes(vec![0; len].into()), false, None)
    }

    /// Copy `bytes` into a fresh value.
    pub fn new_copy(type_id: TypeId, bytes: &[u8]) -> Data {
        Data::build(type_id, Payload::Bytes(bytes.into()), false, None)
    }

    /// Borrow program-lifetime bytes; the value is constant.
    pub fn new_static(type_id: TypeId, bytes: &'static [u8]) -> Data {
        Data::build(type_id, Payload::Static(bytes), true, None)
    }

    /// Wrap a parsed JSON tree (the `jsonc` payload form).
    pub fn new_json(type_id: TypeId, value: Value) -> Data {
        Data::build(type_id, Payload::Json(value), false, None)
    }

    pub fn type_id(&self) -> TypeId {
        self.inner.type_id
    }

    /// Same bytes under another type. The alias depends on `self`, so the
    /// original outlives it.
    pub fn alias(&self, type_id: TypeId) -> Data {
        let alias = Data {
            inner: Arc::new(DataInner {
                type_id,
                payload: self.inner.payload.clone(),
                constant: AtomicBool::new(self.is_constant()),
                volatile_: AtomicBool::new(false),
                disposer: Mutex::new(None),
                deps: Mutex::new(vec![self.clone()]),
                cache: Mutex::new(Vec::new()),
                opaque_id: Mutex::new(None),
            }),
        };
        alias
    }

    /// Two handles on the very same value?
    pub fn same(&self, other: &Data) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard {
            guard: self.inner.payload.read().unwrap(),
        }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        self.inner
            .payload
            .try_read()
            .ok()
            .map(|guard| ReadGuard { guard })
    }

    /// Exclusive write access; refused on constant values. Static payloads
    /// are re-owned so the caller can mutate them.
    pub fn write(&self) -> Result<WriteGuard<'_>, DataError> {
        if self.is_constant() {
            return Err(DataError::Constant);
        }
        let mut guard = self.inner.payload.write().unwrap();
        reown_static(&mut guard);
        Ok(WriteGuard { guard })
    }

    pub fn try_write(&self) -> Result<Option<WriteGuard<'_>>, DataError> {
        if self.is_constant() {
            return Err(DataError::Constant);
        }
        match self.inner.payload.try_write() {
            Ok(mut guard) => {
                reown_static(&mut guard);
                Ok(Some(WriteGuard { guard }))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the value; irreversible.
    pub fn set_constant(&self) {
        self.inner.constant.store(true, Ordering::Release);
    }

    pub fn is_constant(&self) -> bool {
        self.inner.constant.load(Ordering::Acquire)
    }

    pub fn set_volatile(&self, volatile_: bool) {
        self.inner.volatile_.store(volatile_, Ordering::Release);
    }

    pub fn is_volatile(&self) -> bool {
        self.inner.volatile_.load(Ordering::Acquire)
    }

    /// Declare that `self` depends on `parent`: `parent` now lives at
    /// least as long as `self`. Dependencies must stay acyclic.
    pub fn add_dependency(&self, parent: &Data) {
        self.inner.deps.lock().unwrap().push(parent.clone());
    }

    /// The value changed: drop every cached conversion of it.
    pub fn notify_changed(&self) {
        self.inner.cache.lock().unwrap().clear();
    }

    pub(crate) fn cache_lookup(&self, type_id: TypeId) -> Option<Data> {
        let cache = self.inner.cache.lock().unwrap();
        cache
            .iter()
            .find(|(tid, _)| *tid == type_id)
            .and_then(|(_, weak)| weak.upgrade())
            .map(|inner| Data { inner })
    }

    pub(crate) fn cache_store(&self, type_id: TypeId, value: &Data) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.retain(|(tid, weak)| *tid != type_id && weak.strong_count() > 0);
        cache.push((type_id, Arc::downgrade(&value.inner)));
    }

    pub(crate) fn inner(&self) -> &Arc<DataInner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<DataInner>) -> Data {
        Data { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DataInner> {
        Arc::downgrade(&self.inner)
    }
}
