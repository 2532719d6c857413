//! Readback delivery.
//!
//! Readback staging filled by a baked command buffer becomes readable when
//! the batch completes. Results are turned into `UploadDataAndCopy` pushes
//! and parked in an outbox that the channel loop drains ahead of its next
//! response.

use parking_lot::Mutex;
use tracing::{debug, warn};

use rgfx_core::{BatchId, FrameListener};
use rgfx_protocol::messages::{Log, UploadDataAndCopy};
use rgfx_protocol::{FrameId, Frame};

use crate::replay::PendingReadback;

pub const LOG_ERROR: u8 = 0;
pub const LOG_WARN: u8 = 1;

#[derive(Default)]
pub struct ReadbackQueue {
    pending: Mutex<Vec<(BatchId, PendingReadback)>>,
    outbox: Mutex<Vec<Frame>>,
}

impl ReadbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, batch: BatchId, readbacks: Vec<PendingReadback>) {
        if readbacks.is_empty() {
            return;
        }
        self.pending.lock().extend(readbacks.into_iter().map(|r| (batch, r)));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a log line for the client.
    pub fn log(&self, level: u8, target: &str, message: impl Into<String>) {
        let log = Log { level, target: target.to_string(), message: message.into() };
        self.outbox.lock().push(Frame::new(log));
    }

    /// Deliver every readback of a completed batch.
    pub fn complete_batch(&self, batch: BatchId) {
        self.deliver(|b, _| *b == batch);
    }

    /// Forget readbacks of a batch that will never run.
    pub fn cancel_batch(&self, batch: BatchId) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(b, _)| *b != batch);
        if pending.len() != before {
            debug!(%batch, dropped = before - pending.len(), "readbacks of skipped batch dropped");
        }
    }

    /// Deliver everything. Only valid once the device is idle.
    pub fn complete_all(&self) {
        self.deliver(|_, _| true);
    }

    /// Push frames waiting to be sent, in the order they were produced.
    pub fn drain(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.outbox.lock())
    }

    fn deliver(&self, ready: impl Fn(&BatchId, &PendingReadback) -> bool) {
        let ready: Vec<PendingReadback> = {
            let mut pending = self.pending.lock();
            let mut taken = Vec::new();
            pending.retain(|(batch, readback)| {
                if ready(batch, readback) {
                    taken.push(readback.clone());
                    false
                } else {
                    true
                }
            });
            taken
        };
        if ready.is_empty() {
            return;
        }

        let mut outbox = self.outbox.lock();
        for readback in ready {
            match readback.collect() {
                Ok(data) => {
                    debug!(token = readback.token, bytes = data.len(), "readback delivered");
                    outbox.push(Frame::with_blob(UploadDataAndCopy { token: readback.token, offset: 0 }, data));
                }
                Err(e) => {
                    warn!(token = readback.token, error = %e, "readback lost");
                    outbox.push(Frame::new(Log {
                        level: LOG_ERROR,
                        target: "rgfx::readback".into(),
                        message: format!("readback {} lost: {}", readback.token, e),
                    }));
                }
            }
        }
    }
}

impl FrameListener for ReadbackQueue {
    fn on_frame_retired(&self, frame: FrameId) {
        self.deliver(|_, readback| readback.frame.unique() <= frame.unique());
    }
}
