//! Shared helpers for the test suites: fd pairs, scripted permission
//! authorities, loop drivers and collecting sinks.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbus_auth::{Authority, Decision, PermQuery};
use mbus_core::{CallReply, Event, EventSink, ReplyHandler, Runtime};
use mbus_data::Data;
use mbus_evloop::{EvError, EvMgr};

/// A connected pair of unix stream sockets.
pub fn stream_pair() -> (OwnedFd, OwnedFd) {
    nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::empty(),
    )
    .expect("socketpair")
}

/// Drive `mgr` until `pred` holds or `limit` elapses; returns whether the
/// predicate was reached.
pub fn drive_until<F: FnMut() -> bool>(mgr: &EvMgr, limit: Duration, mut pred: F) -> bool {
    let t0 = Instant::now();
    loop {
        if pred() {
            return true;
        }
        if t0.elapsed() >= limit {
            return pred();
        }
        mgr.flush_jobs();
        match mgr.run(20) {
            Ok(_) | Err(EvError::Interrupted) => {}
            Err(e) => panic!("loop failure: {e}"),
        }
    }
}

/// Same, over a runtime.
pub fn drive_runtime_until<F: FnMut() -> bool>(rt: &Runtime, limit: Duration, pred: F) -> bool {
    drive_until(rt.evmgr(), limit, pred)
}

// ---------------------------------------------------------------------------
// Scripted authority
// ---------------------------------------------------------------------------

/// Authority answering from a fixed permission table; unknown permissions
/// are denied. Records every consultation.
pub struct ScriptedAuthority {
    verdicts: Mutex<HashMap<String, i32>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedAuthority {
    pub fn new() -> Arc<ScriptedAuthority> {
        Arc::new(ScriptedAuthority {
            verdicts: Mutex::new(HashMap::new()),
            asked: Mutex::new(Vec::new()),
        })
    }

    /// Grant (status 1) or deny (status 0) a permission.
    pub fn set(&self, permission: &str, granted: bool) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(permission.to_string(), i32::from(granted));
    }

    /// Make a permission fail with a negative authority status.
    pub fn set_failing(&self, permission: &str, status: i32) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(permission.to_string(), status);
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl Authority for ScriptedAuthority {
    fn check(&self, query: &PermQuery, decision: Decision) {
        self.asked.lock().unwrap().push(query.permission.clone());
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .get(&query.permission)
            .copied()
            .unwrap_or(0);
        decision.complete(verdict);
    }
}

// ---------------------------------------------------------------------------
// Collecting sinks
// ---------------------------------------------------------------------------

/// Event sink retaining every push it sees.
pub struct CollectingSink {
    pushes: Mutex<Vec<(String, Vec<Data>)>>,
}

impl CollectingSink {
    pub fn new() -> Arc<CollectingSink> {
        Arc::new(CollectingSink {
            pushes: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn names(&self) -> Vec<String> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &Event, params: &[Data]) {
        self.pushes
            .lock()
            .unwrap()
            .push((event.name().to_string(), params.to_vec()));
    }
}

/// Reply handler capturing the reply and routing subscriptions onto a
/// caller-owned sink, like a connected peer would.
pub struct SubscribingReply {
    reply: Arc<Mutex<Option<CallReply>>>,
    sink: Arc<dyn EventSink>,
}

impl SubscribingReply {
    pub fn new(sink: Arc<dyn EventSink>) -> (Box<SubscribingReply>, Arc<Mutex<Option<CallReply>>>)
    {
        let slot = Arc::new(Mutex::new(None));
        (
            Box::new(SubscribingReply {
                reply: slot.clone(),
                sink,
            }),
            slot,
        )
    }
}

impl ReplyHandler for SubscribingReply {
    fn reply(&mut self, status: i32, params: Vec<Data>) {
        *self.reply.lock().unwrap() = Some(CallReply { status, params });
    }

    fn subscribe(&mut self, event: &Event) -> i32 {
        event.subscribe(&self.sink);
        0
    }

    fn unsubscribe(&mut self, event: &Event) -> i32 {
        event.unsubscribe(&self.sink);
        0
    }
}
