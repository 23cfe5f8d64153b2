//! Behavioural tests driving full prepare/wait/dispatch cycles.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbus_evloop::{EvError, EvMgr, EV_HUP, EV_IN};

fn stream_pair() -> (OwnedFd, OwnedFd) {
    nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::empty(),
    )
    .expect("socketpair")
}

/// Run cycles until `pred` holds or `limit` elapses.
fn drive_until<F: FnMut() -> bool>(mgr: &EvMgr, limit: Duration, mut pred: F) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < limit {
        if pred() {
            return true;
        }
        match mgr.run(20) {
            Ok(_) | Err(EvError::Interrupted) => {}
            Err(e) => panic!("loop failure: {e}"),
        }
    }
    pred()
}

#[test]
fn fd_source_receives_bytes() {
    let mgr = EvMgr::new().unwrap();
    let (a, b) = stream_pair();
    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = got.clone();
    let _src = mgr
        .add_fd(
            b.as_raw_fd(),
            EV_IN,
            move |efd, revents| {
                if revents & EV_IN != 0 {
                    let mut buf = [0u8; 64];
                    let n = nix::unistd::read(efd.fd(), &mut buf).unwrap_or(0);
                    sink.lock().unwrap().extend_from_slice(&buf[..n]);
                }
            },
            false,
            false,
        )
        .unwrap();

    nix::unistd::write(&a, b"ping").unwrap();
    assert!(drive_until(&mgr, Duration::from_secs(2), || {
        got.lock().unwrap().len() == 4
    }));
    assert_eq!(&*got.lock().unwrap(), b"ping");
}

#[test]
fn hup_is_delivered_then_source_autodropped() {
    let mgr = EvMgr::new().unwrap();
    let (a, b) = stream_pair();
    let hups = Arc::new(AtomicU32::new(0));
    let seen = hups.clone();
    let _src = mgr
        .add_fd(
            b.into_raw_fd(),
            EV_IN,
            move |efd, revents| {
                if revents & EV_IN != 0 {
                    let mut buf = [0u8; 64];
                    let _ = nix::unistd::read(efd.fd(), &mut buf);
                }
                if revents & EV_HUP != 0 {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            },
            true,
            true,
        )
        .unwrap();

    drop(a);
    assert!(drive_until(&mgr, Duration::from_secs(2), || {
        hups.load(Ordering::SeqCst) > 0
    }));
    // The auto-unref source is gone; further cycles stay quiet.
    for _ in 0..3 {
        let _ = mgr.run(10);
    }
    assert_eq!(hups.load(Ordering::SeqCst), 1);
}

#[test]
fn three_shot_timer_counts_down_in_order() {
    let mgr = EvMgr::new().unwrap();
    let decounts = Arc::new(Mutex::new(Vec::new()));
    let sink = decounts.clone();
    let _timer = mgr
        .add_timer(
            false,
            0,
            10,
            3,
            10,
            1,
            move |_timer, decount| sink.lock().unwrap().push(decount),
            true,
        )
        .unwrap();

    assert!(drive_until(&mgr, Duration::from_secs(2), || {
        decounts.lock().unwrap().len() >= 3
    }));
    assert_eq!(&*decounts.lock().unwrap(), &[3, 2, 1]);
    // Spent and auto-unreffed: no fourth occurrence.
    std::thread::sleep(Duration::from_millis(30));
    let _ = mgr.run(10);
    assert_eq!(decounts.lock().unwrap().len(), 3);
}

#[test]
fn infinite_timer_keeps_decount_zero() {
    let mgr = EvMgr::new().unwrap();
    let decounts = Arc::new(Mutex::new(Vec::new()));
    let sink = decounts.clone();
    let timer = mgr
        .add_timer(
            false,
            0,
            5,
            0,
            5,
            1,
            move |_timer, decount| sink.lock().unwrap().push(decount),
            false,
        )
        .unwrap();

    assert!(drive_until(&mgr, Duration::from_secs(2), || {
        decounts.lock().unwrap().len() >= 3
    }));
    assert!(decounts.lock().unwrap().iter().all(|&d| d == 0));
    drop(timer);
}

#[test]
fn posted_jobs_run_on_next_cycle() {
    let mgr = EvMgr::new().unwrap();
    let jobs = mgr.jobs();
    let ran = Arc::new(AtomicU32::new(0));
    let flag = ran.clone();
    jobs.post(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    assert!(drive_until(&mgr, Duration::from_secs(2), || {
        ran.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn prepare_hook_runs_every_cycle() {
    let mgr = EvMgr::new().unwrap();
    let count = Arc::new(AtomicU32::new(0));
    let seen = count.clone();
    let hook = mgr
        .add_prepare(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let _ = mgr.run(5);
    let _ = mgr.run(5);
    assert!(count.load(Ordering::SeqCst) >= 2);
    drop(hook);
    let _ = mgr.run(5); // removal cycle
    let settled = count.load(Ordering::SeqCst);
    let _ = mgr.run(5);
    assert_eq!(count.load(Ordering::SeqCst), settled);
}
