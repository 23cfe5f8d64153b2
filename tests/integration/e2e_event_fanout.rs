//! Event distribution: per-subscriber push, ordering, broadcasts.

use std::sync::{Arc, Mutex};

use mbus_core::{ApiBuilder, Event, EventSink, Runtime};
use mbus_data::{from_u32, to_u32, Data};

struct Ordered {
    got: Mutex<Vec<u32>>,
}

impl EventSink for Ordered {
    fn on_event(&self, _event: &Event, params: &[Data]) {
        self.got.lock().unwrap().push(to_u32(&params[0]).unwrap());
    }
}

#[test]
fn push_order_is_preserved_per_subscriber() {
    let rt = Runtime::new().unwrap();
    let event = rt.new_event("gps", "fix");

    let a = Arc::new(Ordered {
        got: Mutex::new(Vec::new()),
    });
    let b = Arc::new(Ordered {
        got: Mutex::new(Vec::new()),
    });
    let a_dyn: Arc<dyn EventSink> = a.clone();
    let b_dyn: Arc<dyn EventSink> = b.clone();
    event.subscribe(&a_dyn);
    event.subscribe(&b_dyn);

    for n in 0..10u32 {
        assert_eq!(event.push(&[from_u32(n)]), 2);
    }
    let expected: Vec<u32> = (0..10).collect();
    assert_eq!(&*a.got.lock().unwrap(), &expected);
    assert_eq!(&*b.got.lock().unwrap(), &expected);
}

#[test]
fn unsubscribed_sinks_stop_receiving() {
    let rt = Runtime::new().unwrap();
    let event = rt.new_event("gps", "fix");
    let a = Arc::new(Ordered {
        got: Mutex::new(Vec::new()),
    });
    let a_dyn: Arc<dyn EventSink> = a.clone();
    event.subscribe(&a_dyn);
    event.push(&[from_u32(1)]);
    event.unsubscribe(&a_dyn);
    event.push(&[from_u32(2)]);
    assert_eq!(&*a.got.lock().unwrap(), &[1]);
}

#[test]
fn broadcast_follows_patterns_across_apis() {
    let rt = Runtime::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for (api_name, pattern) in [("net-watch", "net/*"), ("all-watch", "*/*"), ("disk-watch", "disk/*")]
    {
        let api = ApiBuilder::new(api_name).build().unwrap();
        let sink = seen.clone();
        let tag = api_name.to_string();
        api.on_event(pattern, move |_api, event_name, _params| {
            sink.lock().unwrap().push((tag.clone(), event_name.to_string()));
        });
        rt.register_api(api).unwrap();
    }

    rt.broadcast("net/up", &[]);

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&("net-watch".to_string(), "net/up".to_string())));
    assert!(seen.contains(&("all-watch".to_string(), "net/up".to_string())));
    assert!(!seen.iter().any(|(api, _)| api == "disk-watch"));
}

#[test]
fn event_ids_stay_distinct_within_a_runtime() {
    let rt = Runtime::new().unwrap();
    let ids: Vec<u16> = (0..32)
        .map(|n| rt.new_event("api", &format!("e{n}")).id())
        .collect();
    let mut dedup = ids.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert_eq!(dedup.len(), ids.len());
}
