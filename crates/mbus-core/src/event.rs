//! Named events with per-subscriber push.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mbus_data::Data;
use tracing::trace;

/// Receiving end of event pushes: the caller side of a request (local
/// callback harness or remote stub). Events hold subscribers weakly, so a
/// gone peer silently leaves the set.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event, params: &[Data]);
}

/// Allocator of the small numeric event ids.
#[derive(Default)]
pub struct EventIds {
    next: AtomicU16,
}

impl EventIds {
    pub fn new() -> EventIds {
        EventIds::default()
    }

    fn allocate(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

struct EventInner {
    name: String,
    id: u16,
    subscribers: Mutex<Vec<Weak<dyn EventSink>>>,
}

/// A named event. Pushing delivers to every live subscriber exactly once,
/// in subscription order.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new(ids: &EventIds, name: &str) -> Event {
        Event {
            inner: Arc::new(EventInner {
                name: name.to_string(),
                id: ids.allocate(),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn same(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach `sink`; a second subscription of the same sink is a no-op.
    pub fn subscribe(&self, sink: &Arc<dyn EventSink>) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        let already = subs
            .iter()
            .any(|w| w.upgrade().is_some_and(|s| Arc::ptr_eq(&s, sink)));
        if !already {
            subs.push(Arc::downgrade(sink));
        }
    }

    pub fn unsubscribe(&self, sink: &Arc<dyn EventSink>) {
        self.inner.subscribers.lock().unwrap().retain(|w| {
            w.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, sink))
        });
    }

    /// Deliver `params` to each live subscriber once; returns how many
    /// subscribers were reached.
    pub fn push(&self, params: &[Data]) -> usize {
        let sinks: Vec<Arc<dyn EventSink>> = {
            let mut subs = self.inner.subscribers.lock().unwrap();
            subs.retain(|w| w.strong_count() > 0);
            subs.iter().filter_map(Weak::upgrade).collect()
        };
        trace!(event = %self.inner.name, subscribers = sinks.len(), "event push");
        for sink in &sinks {
            sink.on_event(self, params);
        }
        sinks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|w| w.strong_count() > 0);
        subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Collect {
        got: StdMutex<Vec<String>>,
    }
    impl EventSink for Collect {
        fn on_event(&self, event: &Event, _params: &[Data]) {
            self.got.lock().unwrap().push(event.name().to_string());
        }
    }

    fn sink() -> Arc<Collect> {
        Arc::new(Collect {
            got: StdMutex::new(Vec::new()),
        })
    }

    #[test]
    fn push_reaches_each_subscriber_once() {
        let ids = EventIds::new();
        let ev = Event::new(&ids, "net/up");
        let a = sink();
        let b = sink();
        let a_dyn: Arc<dyn EventSink> = a.clone();
        let b_dyn: Arc<dyn EventSink> = b.clone();
        ev.subscribe(&a_dyn);
        ev.subscribe(&a_dyn); // duplicate ignored
        ev.subscribe(&b_dyn);
        assert_eq!(ev.push(&[]), 2);
        assert_eq!(a.got.lock().unwrap().len(), 1);
        assert_eq!(b.got.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_and_dead_sinks_leave_the_set() {
        let ids = EventIds::new();
        let ev = Event::new(&ids, "net/down");
        let a = sink();
        let b = sink();
        let a_dyn: Arc<dyn EventSink> = a.clone();
        let b_dyn: Arc<dyn EventSink> = b.clone();
        ev.subscribe(&a_dyn);
        ev.subscribe(&b_dyn);
        ev.unsubscribe(&a_dyn);
        assert_eq!(ev.push(&[]), 1);
        assert!(a.got.lock().unwrap().is_empty());

        drop(b_dyn);
        drop(b);
        assert_eq!(ev.push(&[]), 0);
    }

    #[test]
    fn ids_are_distinct() {
        let ids = EventIds::new();
        let a = Event::new(&ids, "a");
        let b = Event::new(&ids, "b");
        assert_ne!(a.id(), b.id());
    }
}
