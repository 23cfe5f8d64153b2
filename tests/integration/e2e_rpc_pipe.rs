//! RPC over a socketpair through FD wrappers: call round-trips, event
//! subscriptions, partial frames, broken pipes.

use std::io::{Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbus_core::{status, ApiBuilder, ClosureReply, Event, Request, Runtime, Verb};
use mbus_data::{from_i32, from_stringz, to_i32, to_stringz};
use mbus_evloop::EvError;
use mbus_rpc::{Frame, FrameReader, RpcSpec, Stub, PROTOCOL_VERSION};
use mbus_sock::{SockSpec, Wrapper};
use mbus_test_utils::{stream_pair, CollectingSink, SubscribingReply};

/// Drive both loops until `pred` holds.
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

fn server_runtime() -> (Runtime, Event) {
    let rt = Runtime::new().unwrap();
    let event = rt.new_event("remote", "tick");
    let ev = event.clone();
    let api = ApiBuilder::new("remote")
        .verb(Verb::new("ping", |req| {
            req.reply_ok(vec![from_stringz("pong")]);
        }))
        .verb(Verb::new("add1", |req| {
            let v = to_i32(&req.params()[0]).unwrap();
            req.reply_ok(vec![from_i32(v + 1)]);
        }))
        .verb(Verb::new("watch", move |req| {
            req.subscribe(&ev);
            req.reply_ok(vec![]);
        }))
        .build()
        .unwrap();
    rt.register_api(api).unwrap();
    (rt, event)
}

fn plain_spec() -> SockSpec {
    SockSpec::parse("unix:@pipe").unwrap()
}

fn wire_pair() -> (Runtime, Event, Runtime, Wrapper, Wrapper) {
    let (server_rt, event) = server_runtime();
    let client_rt = Runtime::new().unwrap();
    let (fd_s, fd_c) = stream_pair();

    let server_stub = Stub::new(&server_rt, RpcSpec::for_api("remote", false));
    let server_wrap =
        Wrapper::create(server_rt.evmgr(), server_stub, fd_s, true, &plain_spec()).unwrap();

    let client_stub = Stub::new(&client_rt, RpcSpec::for_api("remote", true));
    let client_wrap =
        Wrapper::create(client_rt.evmgr(), client_stub, fd_c, false, &plain_spec()).unwrap();
    client_wrap.start_client().unwrap();

    (server_rt, event, client_rt, server_wrap, client_wrap)
}

#[test]
fn remote_call_round_trip() {
    let (server_rt, _event, client_rt, _sw, _cw) = wire_pair();
    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    let reply = reply.lock().unwrap().take().unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(to_stringz(&reply.params[0]).unwrap(), "pong");
}

#[test]
fn numeric_params_cross_the_wire() {
    let (server_rt, _event, client_rt, _sw, _cw) = wire_pair();
    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("remote", "add1", vec![from_i32(41)], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    let reply = reply.lock().unwrap().take().unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(to_i32(&reply.params[0]).unwrap(), 42);
}

#[test]
fn subscription_pushes_cross_the_wire() {
    let (server_rt, event, client_rt, _sw, cw) = wire_pair();

    // Subscribe through a caller that exposes a sink, like a real peer.
    let sink = CollectingSink::new();
    let (handler, slot) = SubscribingReply::new(sink.clone());
    let req = Request::new(
        &client_rt,
        "remote",
        "watch",
        vec![],
        client_rt.local_context(),
        handler,
    );
    client_rt.process(req);
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        slot.lock().unwrap().is_some()
    }));
    assert_eq!(slot.lock().unwrap().as_ref().unwrap().status, 0);

    // A push on the server side lands in the client's sink.
    event.push(&[from_stringz("beat")]);
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        sink.count() == 1
    }));
    assert_eq!(sink.names(), vec!["remote/tick".to_string()]);
    drop(cw);
}

#[test]
fn broken_pipe_fails_in_flight_calls() {
    let (server_rt, _event, client_rt, server_wrap, _cw) = wire_pair();

    // Make sure the link is up first.
    let ready = Arc::new(Mutex::new(None));
    let sink = ready.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        ready.lock().unwrap().is_some()
    }));

    // Cut the pipe, then issue a call: the write fails, the wrapper
    // hangs up and the in-flight map drains with an error reply.
    server_wrap.disconnect();
    drop(server_wrap);
    let reply = Arc::new(Mutex::new(None));
    let sink = reply.clone();
    client_rt.call("remote", "ping", vec![], move |r| {
        *sink.lock().unwrap() = Some(r);
    });

    assert!(drive2(&client_rt, &server_rt, Duration::from_secs(5), || {
        reply.lock().unwrap().is_some()
    }));
    let reply = reply.lock().unwrap().take().unwrap();
    assert_eq!(reply.status, status::DISCONNECTED);
}

#[test]
fn split_frames_are_buffered_until_complete() {
    // A hand-rolled peer speaks to a served wrapper over raw bytes.
    let (server_rt, _event) = server_runtime();
    let (fd_s, fd_c) = stream_pair();
    let stub = Stub::new(&server_rt, RpcSpec::for_api("remote", false));
    let _wrap = Wrapper::create(server_rt.evmgr(), stub, fd_s, true, &plain_spec()).unwrap();

    let mut peer = unsafe { UnixStream::from_raw_fd(fd_c.into_raw_fd()) };
    peer.set_nonblocking(false).unwrap();

    let offer = Frame::VersionOffer {
        versions: vec![PROTOCOL_VERSION],
    }
    .encode();
    let call = Frame::Call {
        id: 1,
        api: "remote".into(),
        verb: "ping".into(),
        session: None,
        token: None,
        creds: None,
        params: vec![],
    }
    .encode();

    // First the offer plus a truncated call frame.
    peer.write_all(&offer).unwrap();
    peer.write_all(&call[..5]).unwrap();
    for _ in 0..20 {
        let _ = server_rt.evmgr().run(10);
    }
    // Then the rest.
    peer.write_all(&call[5..]).unwrap();

    // Collect the accept and the reply from the raw socket.
    peer.set_nonblocking(true).unwrap();
    let mut received = Vec::new();
    let mut frames = Vec::new();
    let t0 = Instant::now();
    while frames.len() < 2 && t0.elapsed() < Duration::from_secs(5) {
        let _ = server_rt.evmgr().run(10);
        let mut chunk = [0u8; 4096];
        match peer.read(&mut chunk) {
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("peer read: {e}"),
        }
        while let Some((frame, used)) = FrameReader::parse(&received).unwrap() {
            received.drain(..used);
            frames.push(frame);
        }
    }

    assert!(matches!(
        frames[0],
        Frame::VersionAccept {
            version: PROTOCOL_VERSION
        }
    ));
    match &frames[1] {
        Frame::Reply { id, status, params } => {
            assert_eq!(*id, 1);
            assert_eq!(*status, 0);
            assert_eq!(params.len(), 1);
            assert_eq!(params[0].bytes, b"pong\0");
        }
        other => panic!("expected reply, got {other:?}"),
    }

}
