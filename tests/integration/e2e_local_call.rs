//! In-process calls: registration, routing, replies, subcalls, cookies.

use std::sync::{Arc, Mutex};

use mbus_core::{status, ApiBuilder, Control, Runtime, Verb};
use mbus_data::{from_stringz, to_stringz};

fn hello_api() -> mbus_core::Api {
    ApiBuilder::new("hello")
        .info("greeting service")
        .verb(
            Verb::new("ping", |req| {
                req.reply_ok(vec![from_stringz("pong")]);
            })
            .with_info("answers pong"),
        )
        .build()
        .unwrap()
}

#[test]
fn call_sync_returns_pong() {
    let rt = Runtime::new().unwrap();
    rt.register_api(hello_api()).unwrap();
    let reply = rt.call_sync("hello", "ping", vec![], 2000);
    assert_eq!(reply.status, status::SUCCESS);
    assert_eq!(reply.params.len(), 1);
    // The reply parameter is the NUL-terminated text "pong".
    assert_eq!(reply.params[0].read().bytes().unwrap(), b"pong\0");
}

#[test]
fn lifecycle_controls_run_on_registration() {
    let rt = Runtime::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let api = ApiBuilder::new("watched")
        .control(move |_api, ctl| {
            sink.lock().unwrap().push(format!("{ctl:?}"));
            0
        })
        .build()
        .unwrap();
    rt.register_api(api).unwrap();
    let seen = seen.lock().unwrap();
    assert!(seen[0].contains("PreInit"));
    assert!(seen[1].contains("Init"));
}

#[test]
fn dynamic_verbs_can_be_added_until_seal() {
    let rt = Runtime::new().unwrap();
    let api = hello_api();
    rt.register_api(api.clone()).unwrap();

    api.add_verb(Verb::new("echo", |req| {
        let text = to_stringz(&req.params()[0]).unwrap();
        req.reply_ok(vec![from_stringz(&text)]);
    }))
    .unwrap();

    let reply = rt.call_sync("hello", "echo", vec![from_stringz("hi")], 2000);
    assert_eq!(reply.status, 0);
    assert_eq!(to_stringz(&reply.params[0]).unwrap(), "hi");

    api.seal();
    assert!(api.add_verb(Verb::new("late", |_| {})).is_err());
}

#[test]
fn aliases_route_to_the_same_api() {
    let rt = Runtime::new().unwrap();
    rt.register_api(hello_api()).unwrap();
    rt.apis().add_alias("greeter", "hello").unwrap();
    let reply = rt.call_sync("greeter", "ping", vec![], 2000);
    assert_eq!(reply.status, 0);
}

#[test]
fn chained_subcalls_propagate_replies() {
    let rt = Runtime::new().unwrap();
    rt.register_api(hello_api()).unwrap();
    let api = ApiBuilder::new("relay")
        .verb(Verb::new("via", |req| {
            let outer = req.clone();
            req.subcall("hello", "ping", vec![], move |reply| {
                outer.reply(reply.status, reply.params);
            });
        }))
        .verb(Verb::new("via-sync", |req| {
            let reply = req.subcall_sync("hello", "ping", vec![]);
            req.reply(reply.status, reply.params);
        }))
        .build()
        .unwrap();
    rt.register_api(api).unwrap();

    for verb in ["via", "via-sync"] {
        let reply = rt.call_sync("relay", verb, vec![], 2000);
        assert_eq!(reply.status, 0, "verb {verb}");
        assert_eq!(to_stringz(&reply.params[0]).unwrap(), "pong");
    }
}

#[test]
fn cookies_persist_across_calls_of_a_session() {
    let rt = Runtime::new().unwrap();
    let api = ApiBuilder::new("counter")
        .verb(Verb::new("bump", |req| {
            let count = req
                .cookie_get()
                .and_then(|v| v.downcast::<u32>().ok())
                .map_or(0, |v| *v);
            req.cookie_set(Arc::new(count + 1));
            req.reply_ok(vec![mbus_data::from_u32(count + 1)]);
        }))
        .build()
        .unwrap();
    rt.register_api(api).unwrap();

    // Calls share the runtime-local session, so the cookie accumulates.
    for expected in 1..=3u32 {
        let reply = rt.call_sync("counter", "bump", vec![], 2000);
        assert_eq!(mbus_data::to_u32(&reply.params[0]).unwrap(), expected);
    }
}

#[test]
fn client_info_reports_session_and_loa() {
    let rt = Runtime::new().unwrap();
    let api = ApiBuilder::new("who")
        .verb(Verb::new("ami", |req| {
            let info = req.get_client_info();
            assert!(info.get("uuid").is_some());
            assert_eq!(info.get("LOA").and_then(serde_json::Value::as_u64), Some(0));
            req.reply_ok(vec![]);
        }))
        .build()
        .unwrap();
    rt.register_api(api).unwrap();
    assert_eq!(rt.call_sync("who", "ami", vec![], 2000).status, 0);
}

#[test]
fn orphan_broadcast_reaches_the_control() {
    let rt = Runtime::new().unwrap();
    let orphans = Arc::new(Mutex::new(Vec::new()));
    let sink = orphans.clone();
    let api = ApiBuilder::new("quiet")
        .control(move |_api, ctl| {
            if let Control::OrphanEvent(name) = ctl {
                sink.lock().unwrap().push(name.clone());
            }
            0
        })
        .build()
        .unwrap();
    rt.register_api(api).unwrap();
    rt.broadcast("nobody/listens", &[]);
    assert_eq!(&*orphans.lock().unwrap(), &["nobody/listens".to_string()]);
}
