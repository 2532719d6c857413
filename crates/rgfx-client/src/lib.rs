//! rgfx client: capture command streams locally and drive a remote device.
//!
//! [`RemoteDevice`] owns the connection and the local handle table;
//! [`CaptureRecorder`] records context calls into a stream that the host
//! bakes into a native command buffer.

pub mod error;
pub mod arena;
pub mod capture;
pub mod readback;
pub mod device;

pub use arena::BlockArena;
pub use capture::{CaptureRecorder, CapturedStream};
pub use device::{DescriptorUpdate, RemoteBatch, RemoteDevice, Swapchain};
pub use error::ClientError;
pub use readback::ReadbackRegistry;
