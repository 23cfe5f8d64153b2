//! Output side of the stub: a queue of encoded frames the transport
//! drains, as an iovec list for scatter writes or buffer by buffer for
//! message-oriented transports.

use std::io::IoSlice;
use std::sync::Mutex;

/// Queue of pending output buffers (one encoded frame each).
#[derive(Default)]
pub struct Coder {
    queue: Mutex<Vec<Vec<u8>>>,
}

impl Coder {
    pub fn new() -> Coder {
        Coder::default()
    }

    pub(crate) fn push(&self, frame: Vec<u8>) {
        self.queue.lock().unwrap().push(frame);
    }

    /// Anything to send?
    pub fn is_ready(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Total pending length in bytes.
    pub fn pending_size(&self) -> usize {
        self.queue.lock().unwrap().iter().map(Vec::len).sum()
    }

    /// Take every pending buffer, in emission order. Stream transports
    /// may concatenate them into one write; message transports send one
    /// message per buffer.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }

    /// Append previously drained buffers back, keeping their order.
    /// Used around reconnections, where a version offer must precede the
    /// frames already queued.
    pub fn requeue(&self, bufs: Vec<Vec<u8>>) {
        self.queue.lock().unwrap().extend(bufs);
    }

    /// Run `write` over the pending buffers as one iovec list; on success
    /// the buffers are disposed, on error they are requeued untouched.
    pub fn drain_vectored<F>(&self, write: F) -> std::io::Result<usize>
    where
        F: FnOnce(&[IoSlice<'_>]) -> std::io::Result<usize>,
    {
        let buffers = self.drain();
        if buffers.is_empty() {
            return Ok(0);
        }
        let slices: Vec<IoSlice<'_>> = buffers.iter().map(|b| IoSlice::new(b)).collect();
        match write(&slices) {
            Ok(n) => Ok(n),
            Err(e) => {
                // Put everything back ahead of newer frames.
                let mut queue = self.queue.lock().unwrap();
                let mut restored = buffers;
                restored.append(&mut queue);
                *queue = restored;
                Err(e)
            }
        }
    }
}
