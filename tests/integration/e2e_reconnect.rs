//! Robustified wrappers: reopen-on-demand with an every-other-attempt
//! failure, version renegotiation ahead of queued frames.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbus_core::{status, ApiBuilder, Runtime, Verb};
use mbus_data::from_stringz;
use mbus_evloop::EvError;
use mbus_rpc::{RpcSpec, Stub};
use mbus_sock::{Robustify, SockSpec, Wrapper};
use mbus_test_utils::stream_pair;

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

/// Server harness handing out fresh server-side connections.
struct Respawner {
    runtime: Runtime,
    wrappers: Mutex<Vec<Wrapper>>,
}

impl Respawner {
    fn new() -> Arc<Respawner> {
        let runtime = Runtime::new().unwrap();
        let api = ApiBuilder::new("remote")
            .verb(Verb::new("ping", |req| {
                req.reply_ok(vec![from_stringz("pong")]);
            }))
            .build()
            .unwrap();
        runtime.register_api(api).unwrap();
        Arc::new(Respawner {
            runtime,
            wrappers: Mutex::new(Vec::new()),
        })
    }

    /// New socketpair: server wrapper on one end, the other returned.
    fn spawn(&self) -> OwnedFd {
        let (fd_s, fd_c) = stream_pair();
        let stub = Stub::new(&self.runtime, RpcSpec::for_api("remote", false));
        let wrapper = Wrapper::create(
            self.runtime.evmgr(),
            stub,
            fd_s,
            true,
            &SockSpec::parse("unix:@respawn").unwrap(),
        )
        .unwrap();
        self.wrappers.lock().unwrap().push(wrapper);
        fd_c
    }
}

#[test]
fn reconnect_succeeds_every_second_attempt() {
    let server = Respawner::new();
    let client_rt = Runtime::new().unwrap();

    let stub = Stub::new(&client_rt, RpcSpec::for_api("remote", true));
    let wrapper = Wrapper::create(
        client_rt.evmgr(),
        stub,
        server.spawn(),
        false,
        &SockSpec::parse("unix:@respawn").unwrap(),
    )
    .unwrap();
    wrapper.start_client().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let reopen_server = server.clone();
    wrapper.robustify(Robustify {
        reopen: Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 2 == 1 {
                Err(-nix::libc::EPIPE)
            } else {
                Ok(reopen_server.spawn())
            }
        }),
        release: None,
    });

    // Working link first.
    let ok = Arc::new(Mutex::new(None));
    let sink = ok.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server.runtime, Duration::from_secs(5), || {
        ok.lock().unwrap().is_some()
    }));
    assert_eq!(ok.lock().unwrap().take().unwrap().status, 0);

    // Kill the server end; the next send hits EPIPE and fails fast.
    server.wrappers.lock().unwrap().drain(..).for_each(|w| w.disconnect());
    let dead = Arc::new(Mutex::new(None));
    let sink = dead.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server.runtime, Duration::from_secs(5), || {
        dead.lock().unwrap().is_some()
    }));
    assert_eq!(
        dead.lock().unwrap().take().unwrap().status,
        status::DISCONNECTED
    );

    // First retry: reopen fails (odd attempt), the call stays queued.
    let queued = Arc::new(Mutex::new(None));
    let sink = queued.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    for _ in 0..5 {
        let _ = client_rt.evmgr().run(5);
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(queued.lock().unwrap().is_none(), "no transport yet");

    // Second retry: reopen succeeds; the version offer goes out first,
    // then both queued calls complete.
    let second = Arc::new(Mutex::new(None));
    let sink = second.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server.runtime, Duration::from_secs(5), || {
        queued.lock().unwrap().is_some() && second.lock().unwrap().is_some()
    }));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(queued.lock().unwrap().take().unwrap().status, 0);
    assert_eq!(second.lock().unwrap().take().unwrap().status, 0);
    assert!(!wrapper.is_destroyed());
}
