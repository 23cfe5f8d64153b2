//! Event-manager scenarios: counted timers, wakeups, deadline progress.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mbus_evloop::{EvError, EvMgr};

#[test]
fn three_shot_timer_fires_in_decount_order() {
    let mgr = EvMgr::new().unwrap();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    let _timer = mgr
        .add_timer(
            false,
            0,
            10,
            3,
            10,
            1,
            move |_timer, decount| {
                sink.lock().unwrap().push((decount, Instant::now()));
            },
            true,
        )
        .unwrap();

    let t0 = Instant::now();
    while fired.lock().unwrap().len() < 3 && t0.elapsed() < Duration::from_secs(2) {
        match mgr.run(20) {
            Ok(_) | Err(EvError::Interrupted) => {}
            Err(e) => panic!("loop failure: {e}"),
        }
    }

    let fired = fired.lock().unwrap();
    let decounts: Vec<u32> = fired.iter().map(|(d, _)| *d).collect();
    assert_eq!(decounts, vec![3, 2, 1]);

    // Deadlines progress monotonically.
    for pair in fired.windows(2) {
        assert!(pair[1].1 >= pair[0].1);
    }
}

#[test]
fn spent_timer_does_not_fire_again() {
    let mgr = EvMgr::new().unwrap();
    let count = Arc::new(AtomicU32::new(0));
    let sink = count.clone();
    let _timer = mgr
        .add_timer(
            false,
            0,
            5,
            2,
            5,
            1,
            move |_timer, _decount| {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            true,
        )
        .unwrap();
    let t0 = Instant::now();
    while t0.elapsed() < Duration::from_millis(200) {
        let _ = mgr.run(10);
    }
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn wakeup_beats_the_running_wait() {
    let mgr = EvMgr::new().unwrap();
    let handle = mgr.wakeup_handle();

    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.wakeup();
    });

    mgr.prepare().unwrap();
    let t0 = Instant::now();
    let rc = mgr.wait(5000);
    waker.join().unwrap();
    assert!(matches!(rc, Err(EvError::Interrupted)));
    assert!(t0.elapsed() < Duration::from_secs(4), "wait returned early");
}

#[test]
fn wakeup_before_wait_is_consumed_by_the_next_wait() {
    let mgr = EvMgr::new().unwrap();
    mgr.wakeup();
    mgr.prepare().unwrap();
    assert!(matches!(mgr.wait(1000), Err(EvError::Interrupted)));
    // Consumed: the next cycle is a plain timeout again.
    mgr.prepare().unwrap();
    assert!(!mgr.wait(10).unwrap());
}

#[test]
fn timer_deadline_clamps_the_wait() {
    let mgr = EvMgr::new().unwrap();
    let fired = Arc::new(AtomicU32::new(0));
    let sink = fired.clone();
    let _timer = mgr
        .add_timer(
            false,
            0,
            20,
            1,
            1000,
            5,
            move |_timer, _decount| {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            true,
        )
        .unwrap();

    // A "no limit" run still returns when the timer is due.
    let t0 = Instant::now();
    let mut guard = 0;
    while fired.load(Ordering::SeqCst) == 0 && guard < 100 {
        let _ = mgr.run(-1);
        guard += 1;
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(t0.elapsed() < Duration::from_secs(5));
}

#[test]
fn modify_period_reschedules() {
    let mgr = EvMgr::new().unwrap();
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sink = stamps.clone();
    let timer = mgr
        .add_timer(
            false,
            0,
            5,
            0,
            5,
            1,
            move |_timer, _decount| sink.lock().unwrap().push(Instant::now()),
            false,
        )
        .unwrap();

    let t0 = Instant::now();
    while stamps.lock().unwrap().len() < 2 && t0.elapsed() < Duration::from_secs(2) {
        let _ = mgr.run(10);
    }
    timer.modify_period(50);
    let len_before = stamps.lock().unwrap().len();
    let t1 = Instant::now();
    while stamps.lock().unwrap().len() <= len_before && t1.elapsed() < Duration::from_secs(2) {
        let _ = mgr.run(20);
    }
    // The next occurrence came one full new period later.
    let stamps = stamps.lock().unwrap();
    let gap = stamps[len_before] - t1;
    assert!(gap >= Duration::from_millis(40), "gap was {gap:?}");
}
