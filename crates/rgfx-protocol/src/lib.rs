pub mod handle;
pub mod types;
pub mod records;
pub mod messages;
pub mod wire;
pub mod error;

pub use handle::{RemoteId, ResourceType};
pub use messages::{Message, MessageKind, MessageTypeId, SemaphoreValue, PROTOCOL_VERSION};
pub use records::{ContextKind, Record, RecordStream, CATALOG_VERSION};
pub use types::{FrameId, QueueType};
pub use error::ProtocolError;
pub use wire::{Frame, WireError};
