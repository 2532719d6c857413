use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use rgfx_core::config::GraphicsConfig;
use rgfx_protocol::messages::DeviceInfo;

use crate::backend::GpuBackend;
use crate::device::HostDevice;
use crate::error::ServerError;

/// Builds the backend behind each new session's device.
pub type BackendFactory = Arc<dyn Fn(&GraphicsConfig) -> Arc<dyn GpuBackend> + Send + Sync>;

/// Per-client session state on the server side.
/// Every channel a client opens joins the same session; the device and all
/// of its resources go away when the last channel closes.
pub struct Session {
    pub session_id: u32,
    /// Secret presented by additional channels to join this session
    pub token: u64,
    pub client_name: String,
    device: RwLock<Option<Arc<HostDevice>>>,
    channels: AtomicU32,
    opened: Instant,
    /// Milliseconds after `opened` of the last frame seen on any channel
    last_active_ms: AtomicU64,
    in_flight: AtomicU32,
}

impl Session {
    pub fn new(session_id: u32, token: u64, client_name: String) -> Self {
        Self {
            session_id,
            token,
            client_name,
            device: RwLock::new(None),
            channels: AtomicU32::new(0),
            opened: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Create the device on first use. Later calls, from any channel, return
    /// the existing device's info.
    pub fn init_device(
        &self,
        backends: &BackendFactory,
        config: &GraphicsConfig,
        host_name: &str,
    ) -> DeviceInfo {
        let mut device = self.device.write();
        if let Some(existing) = device.as_ref().filter(|d| !d.is_shut_down()) {
            return existing.info();
        }
        let created = Arc::new(HostDevice::new(backends(config), config, host_name));
        info!(
            session_id = self.session_id,
            device = %created.info().device_name,
            "device initialized"
        );
        let info = created.info();
        *device = Some(created);
        info
    }

    pub fn device(&self) -> Result<Arc<HostDevice>, ServerError> {
        self.device.read().clone().ok_or(ServerError::NoDevice)
    }

    /// Record traffic on any channel of this session.
    fn touch(&self) {
        let now = u64::try_from(self.opened.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_active_ms.fetch_max(now, Ordering::AcqRel);
    }

    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn request_finished(&self) {
        self.touch();
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Time since the last frame on any channel, zero while a request is
    /// being served. Channels that only carry concurrent traffic stay open
    /// while a sibling keeps the session busy.
    pub fn idle_for(&self) -> Duration {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            return Duration::ZERO;
        }
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Acquire));
        self.opened.elapsed().saturating_sub(last)
    }

    pub fn channel_opened(&self) -> u32 {
        self.touch();
        self.channels.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns true when this was the last open channel.
    pub fn channel_closed(&self) -> bool {
        self.channels.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn channel_count(&self) -> u32 {
        self.channels.load(Ordering::Acquire)
    }

    /// Tear the device down. Blocks until submitted work drains.
    pub fn close(&self) {
        let Some(device) = self.device.write().take() else {
            return;
        };
        let leaked = device.shutdown();
        if leaked > 0 {
            warn!(
                session_id = self.session_id,
                "{} resource(s) leaked at disconnect, cleaning up", leaked
            );
        }
    }
}
