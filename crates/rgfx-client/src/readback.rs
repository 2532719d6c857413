//! Readback results pushed by the host.
//!
//! The host sends `UploadDataAndCopy` ahead of whichever response follows the
//! batch's completion, so results usually arrive before anyone asks for
//! them. Waiters that come early park on a oneshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use rgfx_core::GfxError;
use rgfx_protocol::{Frame, Message};
use rgfx_transport::connection::emit_host_log;
use rgfx_transport::PushHandler;

use crate::error::ClientError;

enum Slot {
    Arrived(Vec<u8>),
    Waiting(oneshot::Sender<Vec<u8>>),
}

#[derive(Default)]
pub struct ReadbackRegistry {
    slots: DashMap<u64, Slot>,
    failed: AtomicBool,
}

impl ReadbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store data for `token` at `offset`, waking a parked waiter.
    pub fn deliver(&self, token: u64, offset: u64, data: Vec<u8>) {
        let data = if offset == 0 {
            data
        } else {
            let mut placed = vec![0u8; offset as usize];
            placed.extend_from_slice(&data);
            placed
        };
        match self.slots.entry(token) {
            Entry::Occupied(entry) => match entry.remove() {
                Slot::Waiting(tx) => {
                    let _ = tx.send(data);
                }
                Slot::Arrived(mut existing) => {
                    merge(&mut existing, offset as usize, &data[offset as usize..]);
                    self.slots.insert(token, Slot::Arrived(existing));
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Arrived(data));
            }
        }
        debug!(token, "readback arrived");
    }

    /// Take the data for `token` if it is already here.
    pub fn take(&self, token: u64) -> Option<Vec<u8>> {
        match self.slots.remove_if(&token, |_, slot| matches!(slot, Slot::Arrived(_))) {
            Some((_, Slot::Arrived(data))) => Some(data),
            _ => None,
        }
    }

    /// Wait for `token`. Only a request in flight reads pushes, so wait after
    /// the batch's `wait_batch` or the frame's `wait_all`.
    pub async fn wait(&self, token: u64, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        let rx = match self.slots.entry(token) {
            Entry::Occupied(entry) => match entry.remove() {
                Slot::Arrived(data) => return Ok(data),
                Slot::Waiting(_) => {
                    return Err(GfxError::validation(format!("readback {} already awaited", token)).into())
                }
            },
            Entry::Vacant(entry) => {
                if self.failed.load(Ordering::Acquire) {
                    return Err(ClientError::ConnectionLost);
                }
                let (tx, rx) = oneshot::channel();
                entry.insert(Slot::Waiting(tx));
                rx
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.slots.remove_if(&token, |_, slot| matches!(slot, Slot::Waiting(_)));
                Err(GfxError::Timeout(timeout).into())
            }
        }
    }

    /// Wake every waiter with `ConnectionLost` and refuse new ones.
    pub fn fail_all(&self) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.retain(|_, slot| matches!(slot, Slot::Arrived(_)));
        warn!("pending readbacks failed");
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot.value(), Slot::Waiting(_))).count()
    }
}

fn merge(into: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if into.len() < end {
        into.resize(end, 0);
    }
    into[offset..end].copy_from_slice(data);
}

impl PushHandler for ReadbackRegistry {
    fn on_push(&self, frame: Frame) {
        match frame.message {
            Message::UploadDataAndCopy(copy) => self.deliver(copy.token, copy.offset, frame.blob),
            Message::Log(log) => emit_host_log(&log),
            other => warn!(message = other.name(), "unhandled push dropped"),
        }
    }
}
