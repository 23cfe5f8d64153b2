//! Deferred jobs: closures posted from anywhere, run on the loop thread
//! at the next prepare phase.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use mio::Waker;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct JobsShared {
    queue: Mutex<VecDeque<Job>>,
    waker: Arc<Waker>,
}

impl JobsShared {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        JobsShared {
            queue: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub(crate) fn run_pending(&self) {
        loop {
            let job = self.queue.lock().unwrap().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }
}

/// Posting side of the loop's job queue. Clone freely; `Send` closures
/// only, since the poster may live on any thread.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<JobsShared>,
}

impl JobQueue {
    pub(crate) fn new(shared: Arc<JobsShared>) -> Self {
        JobQueue { shared }
    }

    /// Queue `job` and wake the loop so it runs promptly.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.lock().unwrap().push_back(Box::new(job));
        let _ = self.shared.waker.wake();
    }
}
