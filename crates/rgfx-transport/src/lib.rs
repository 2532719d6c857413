pub mod error;
pub mod framing;
pub mod pool;
pub mod connection;

pub use connection::{Connection, ConnectionOptions, PushHandler, TracingPushHandler};
pub use error::TransportError;
pub use pool::{ChannelGuard, ChannelPool};
