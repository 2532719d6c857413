//! Client-visible resource table for one session.
//!
//! The backend owns resource lifetime; this table remembers what the client
//! created (for `DescribeResource` and for cleanup when the session ends)
//! and holds baked command buffers until their frame retires.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use rgfx_core::{FrameListener, Handle};
use rgfx_protocol::messages::ResourceDescription;
use rgfx_protocol::FrameId;

use crate::backend::{GpuBackend, ResourceBackend, ResourceInfo};

struct Tracked {
    label: String,
}

pub struct ResourceTable {
    backend: Arc<dyn GpuBackend>,
    created: DashMap<Handle, Tracked>,
    /// Baked command buffers per recording frame.
    cmdbufs: Mutex<Vec<(FrameId, Handle)>>,
}

impl ResourceTable {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self { backend, created: DashMap::new(), cmdbufs: Mutex::new(Vec::new()) }
    }

    pub fn track(&self, handle: Handle, label: impl Into<String>) {
        self.created.insert(handle, Tracked { label: label.into() });
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Release a client-created resource. False when the id is unknown or
    /// already released.
    pub fn release(&self, handle: Handle) -> bool {
        if self.created.remove(&handle).is_none() {
            return false;
        }
        self.backend.release(handle)
    }

    pub fn describe(&self, handle: Handle) -> ResourceDescription {
        let label = self.created.get(&handle).map(|t| t.label.clone()).unwrap_or_default();
        match self.backend.describe(handle) {
            Some(info) => ResourceDescription {
                alive: true,
                label,
                buffer: match info {
                    ResourceInfo::Buffer(desc) => Some(desc),
                    _ => None,
                },
                image: match info {
                    ResourceInfo::Image(desc) => Some(desc),
                    _ => None,
                },
            },
            None => ResourceDescription { alive: false, label, buffer: None, image: None },
        }
    }

    /// Keep `cmdbuf` alive until `frame` retires.
    pub fn hold_cmdbuf(&self, frame: FrameId, cmdbuf: Handle) {
        self.cmdbufs.lock().push((frame, cmdbuf));
    }

    /// Release everything the session still holds. Returns how many client
    /// resources were left behind.
    pub fn release_all(&self) -> usize {
        let leaked: Vec<Handle> = self.created.iter().map(|e| *e.key()).collect();
        for handle in &leaked {
            self.release(*handle);
        }
        for (_, cmdbuf) in self.cmdbufs.lock().drain(..) {
            self.backend.release(cmdbuf);
        }
        self.backend.retire_all();
        if !leaked.is_empty() {
            debug!(count = leaked.len(), "released resources left by the client");
        }
        leaked.len()
    }
}

impl FrameListener for ResourceTable {
    fn on_begin_frame(&self, frame: FrameId) {
        self.backend.begin_frame(frame);
    }

    fn on_frame_retired(&self, frame: FrameId) {
        let done: Vec<Handle> = {
            let mut cmdbufs = self.cmdbufs.lock();
            let mut done = Vec::new();
            cmdbufs.retain(|(f, h)| {
                if f.unique() <= frame.unique() {
                    done.push(*h);
                    false
                } else {
                    true
                }
            });
            done
        };
        for cmdbuf in &done {
            self.backend.release(*cmdbuf);
        }
        if !done.is_empty() {
            trace!(%frame, count = done.len(), "command buffers released");
        }
        self.backend.retire_frame(frame);
    }
}
