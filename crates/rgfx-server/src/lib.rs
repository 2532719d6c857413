//! Host side of rgfx: accepts client sessions, replays baked command
//! streams onto a device backend and schedules their submission.

pub mod error;
pub mod backend;
pub mod software;
pub mod replay;
pub mod readback;
pub mod resources;
pub mod device;
pub mod session;
pub mod server;

pub use backend::{GpuBackend, ResourceBackend};
pub use device::{Dispatched, HostDevice};
pub use error::ServerError;
pub use server::{RgfxServer, ServerMetrics};
pub use session::{BackendFactory, Session};
pub use software::{SoftwareBackend, SoftwareConfig};
