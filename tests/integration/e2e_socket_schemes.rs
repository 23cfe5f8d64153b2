//! Sockets end-to-end: listener + connector over unix paths, abstract
//! names, api lists.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbus_core::{ApiBuilder, Runtime, Verb};
use mbus_data::{from_stringz, to_stringz};
use mbus_evloop::EvError;
use mbus_sock::{connect, Listener, SockSpec};

fn drive2<F: FnMut() -> bool>(a: &Runtime, b: &Runtime, limit: Duration, mut pred: F) -> bool {
    let t0 = Instant::now();
    loop {
        if pred() {
            return true;
        }
        if t0.elapsed() >= limit {
            return pred();
        }
        for rt in [a, b] {
            rt.evmgr().flush_jobs();
            match rt.evmgr().run(5) {
                Ok(_) | Err(EvError::Interrupted) => {}
                Err(e) => panic!("loop failure: {e}"),
            }
        }
    }
}

fn serving_runtime(api_name: &str) -> Runtime {
    let rt = Runtime::new().unwrap();
    let api = ApiBuilder::new(api_name)
        .verb(Verb::new("ping", |req| {
            req.reply_ok(vec![from_stringz("pong")]);
        }))
        .build()
        .unwrap();
    rt.register_api(api).unwrap();
    rt
}

#[test]
fn unix_path_listener_serves_a_remote_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello");
    let uri = format!("unix:{}", path.display());

    let server_rt = serving_runtime("hello");
    let _listener = Listener::bind(&server_rt, &uri).unwrap();

    let client_rt = Runtime::new().unwrap();
    // The listener must get a chance to accept; connect() blocks only
    // for the unix connect itself.
    let wrapper = connect(&client_rt, &uri).unwrap();

    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("hello", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    let reply = reply.lock().unwrap().take().unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(to_stringz(&reply.params[0]).unwrap(), "pong");
    assert!(!wrapper.is_destroyed());
}

#[test]
fn as_api_renames_the_imported_surface() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("com-example-hello");
    let server_uri = format!("unix:{}?as-api=hello", path.display());

    let server_rt = serving_runtime("hello");
    let listener = Listener::bind(&server_rt, &server_uri).unwrap();
    assert_eq!(listener.exported(), vec!["hello".to_string()]);

    // The client names the socket file but imports under the as-api name.
    let client_rt = Runtime::new().unwrap();
    let client_uri = format!("unix:{}?as-api=hello", path.display());
    let _wrapper = connect(&client_rt, &client_uri).unwrap();

    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("hello", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    assert_eq!(reply.lock().unwrap().take().unwrap().status, 0);
}

#[test]
fn comma_list_exports_several_apis() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi");
    let uri = format!("unix:{}?as-api=alpha,beta", path.display());

    let server_rt = Runtime::new().unwrap();
    for name in ["alpha", "beta"] {
        let api = ApiBuilder::new(name)
            .verb(Verb::new("ping", |req| {
                req.reply_ok(vec![from_stringz("pong")]);
            }))
            .build()
            .unwrap();
        server_rt.register_api(api).unwrap();
    }
    let listener = Listener::bind(&server_rt, &uri).unwrap();
    assert_eq!(
        listener.exported(),
        vec!["alpha".to_string(), "beta".to_string()]
    );

    let client_rt = Runtime::new().unwrap();
    let _wrapper = connect(&client_rt, &uri).unwrap();

    for name in ["alpha", "beta"] {
        let reply = Arc::new(Mutex::new(None));
        let sink = reply.clone();
        client_rt.call(name, "ping", vec![], move |r| {
            *sink.lock().unwrap() = Some(r);
        });
        assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
            reply.lock().unwrap().is_some()
        }));
        assert_eq!(reply.lock().unwrap().take().unwrap().status, 0, "{name}");
    }
}

#[test]
fn autoimport_resolver_reaches_directory_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("lazyapi");
    let uri = format!("unix:{}", socket.display());

    let server_rt = serving_runtime("lazyapi");
    let _listener = Listener::bind(&server_rt, &uri).unwrap();

    let client_rt = Runtime::new().unwrap();
    client_rt.apis().set_onlack(mbus_sock::autoset_resolver(
        &client_rt,
        &dir.path().display().to_string(),
    ));

    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("lazyapi", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    assert_eq!(reply.lock().unwrap().take().unwrap().status, 0);

    // Unknown names fail without a second resolver consultation.
    let reply = client_rt.call_sync("nosuch", "ping", vec![], 500);
    assert!(reply.status < 0);
}

#[test]
fn abstract_unix_names_listen_and_connect() {
    // Abstract names are global; use the pid for isolation.
    let name = format!("mbus-test-{}", std::process::id());
    let uri = format!("unix:@{name}?as-api=hello");

    let server_rt = serving_runtime("hello");
    let _listener = Listener::bind(&server_rt, &uri).unwrap();

    let client_rt = Runtime::new().unwrap();
    let _wrapper = connect(&client_rt, &uri).unwrap();
    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("hello", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    assert_eq!(reply.lock().unwrap().take().unwrap().status, 0);
}

#[test]
fn bad_uris_are_rejected() {
    assert!(SockSpec::parse("ws+tls+tcp:h:1/x").is_err());
    assert!(SockSpec::parse("unix:").is_err());
    let spec = SockSpec::parse("tcp:host:99").unwrap();
    assert!(spec.api_name().is_err(), "no api name in uri");
}
