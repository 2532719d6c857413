use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::handle::RemoteId;
use crate::records::CATALOG_VERSION;
use crate::types::{BufferDesc, FrameId, ImageDesc, PixelFormat, QueryKind, QueueType};
use crate::wire::WireError;

/// Current protocol version, exchanged in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message family. Occupies the top 6 bits of a type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageGroup {
    Core = 1,
    Device = 2,
    Swapchain = 3,
    Frame = 4,
    Resource = 5,
    Query = 6,
    Descriptor = 7,
    CmdBuf = 8,
    Staging = 9,
}

/// Stable wire identifier: `group << 10 | index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeId(pub u16);

impl MessageTypeId {
    pub const fn new(group: MessageGroup, index: u16) -> Self {
        Self(((group as u16) << 10) | (index & 0x3FF))
    }

    pub const fn group_bits(self) -> u16 {
        self.0 >> 10
    }

    pub const fn index(self) -> u16 {
        self.0 & 0x3FF
    }
}

impl std::fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.group_bits(), self.index())
    }
}

/// Static identity of one message struct.
pub trait MessageKind: Into<Message> {
    const TYPE_ID: MessageTypeId;
    const NAME: &'static str;
}

/// Timeline semaphore together with the value to wait for or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SemaphoreValue {
    pub semaphore: RemoteId,
    pub value: u64,
}

// ── Core ────────────────────────────────────────────────────

/// Generic acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DefaultResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ErrorResponse {
    pub error: ProtocolError,
}

/// First message on every channel. `session_token == 0` opens a new session;
/// additional channels pass the token from the first `HelloAck`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub client_name: String,
    pub session_token: u64,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct HelloAck {
    pub session_token: u64,
    pub session_id: u32,
    pub server_name: String,
}

/// Server-pushed log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Log {
    /// 0 = error, 1 = warn, 2 = info, 3 = debug
    pub level: u8,
    pub target: String,
    pub message: String,
}

/// Client → host bulk write into a host staging range. Data travels as the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct UploadData {
    pub buffer: RemoteId,
    pub offset: u64,
}

/// Host → client readback result, pushed out-of-band. Data travels as the blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct UploadDataAndCopy {
    pub token: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Ping;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Pong;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct QueryMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct MetricsData {
    pub connections_total: u64,
    pub connections_active: u32,
    pub requests_total: u64,
    pub errors_total: u64,
    pub bakes_total: u64,
    pub bakes_failed: u64,
    pub uptime_secs: u64,
}

// ── Device ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DeviceInit {
    pub app_name: String,
    pub catalog_version: u16,
}

impl DeviceInit {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), catalog_version: CATALOG_VERSION }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub host_name: String,
    pub platform: String,
    pub max_frames: u32,
    pub max_pending_batches: u32,
    pub supports_timeline: bool,
    pub upload_block_size: u32,
    pub catalog_version: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DeviceShutdown;

// ── Swapchain ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SwapchainCreate {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub image_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SwapchainCreated {
    pub swapchain: RemoteId,
    pub images: Vec<RemoteId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SwapchainAcquire {
    pub swapchain: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SwapchainAcquired {
    pub image_index: u32,
    pub image: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SwapchainPresent {
    pub swapchain: RemoteId,
    pub image_index: u32,
    pub wait: Option<SemaphoreValue>,
}

// ── Frame scheduler ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct BeginFrame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FrameBegun {
    pub frame: FrameId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct EndFrame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FrameEnded {
    pub frame: FrameId,
    pub signals: Vec<SemaphoreValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct WaitNextFrame {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FrameWaited {
    pub ok: bool,
    pub retired: Option<FrameId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct WaitAll {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CreateBatch {
    pub queue: QueueType,
    pub label: String,
    pub input_deps: Vec<SemaphoreValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct BatchCreated {
    pub batch: RemoteId,
    pub completion: SemaphoreValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SubmitBatch {
    pub batch: RemoteId,
    pub immediately: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct WaitBatch {
    pub batch: RemoteId,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SkipBatch {
    pub batch: RemoteId,
}

// ── Resource manager ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CreateBuffer {
    pub desc: BufferDesc,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CreateImage {
    pub desc: ImageDesc,
    pub label: String,
}

/// Look up a compiled pipeline by name in the host's pipeline pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct LoadPipeline {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CreateSemaphore {
    pub initial_value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CreateDescriptorSet {
    pub pipeline: RemoteId,
    pub set_index: u32,
}

/// Response to every create request. `id` is invalid on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResourceCreated {
    pub id: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ReleaseResource {
    pub id: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DescribeResource {
    pub id: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResourceDescription {
    pub alive: bool,
    pub label: String,
    pub buffer: Option<BufferDesc>,
    pub image: Option<ImageDesc>,
}

// ── Query pools ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CreateQueryPool {
    pub kind: QueryKind,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ReadQueries {
    pub pool: RemoteId,
    pub first: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct QueryResults {
    pub values: Vec<u64>,
}

// ── Descriptor updates ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub element: u32,
    pub resource: RemoteId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DescriptorUpdateFlush {
    pub set: RemoteId,
    pub writes: Vec<DescriptorWrite>,
}

// ── Command buffer bake ─────────────────────────────────────

/// Host payload `[stream_offset, stream_offset + size)` in the payload part
/// of the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct HostToDevCopy {
    pub stream_offset: u64,
    pub size: u64,
}

/// Device → host copy result routed back to the client under `token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DevToHostCopy {
    pub token: u64,
    pub size: u64,
}

/// Baked command stream. Blob layout: `records_size` bytes of length-prefixed
/// records, followed by the payload stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CmdBufBake {
    pub batch: RemoteId,
    pub exe_index: u32,
    pub catalog_version: u16,
    pub record_count: u32,
    pub block_size: u32,
    pub records_size: u64,
    pub host_to_dev: Vec<HostToDevCopy>,
    pub dev_to_host: Vec<DevToHostCopy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct CmdBufBaked {
    /// Invalid when replay failed.
    pub cmdbuf: RemoteId,
}

// ── Staging ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum StagingHeap {
    Static,
    Dynamic,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StagingGetRanges {
    pub size: u64,
    pub block_size: u64,
    pub alignment: u64,
    pub heap: StagingHeap,
    pub upload: bool,
    pub queue: QueueType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StagingRangeDesc {
    pub buffer: RemoteId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StagingRanges {
    pub frame: FrameId,
    pub ranges: Vec<StagingRangeDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StagingFrameStat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct StagingStat {
    pub dynamic_write: u64,
    pub dynamic_read: u64,
    pub static_write: u64,
    pub static_read: u64,
}

// ============================================================================
// Catalog
// ============================================================================

type DecodeFn = fn(&[u8]) -> Result<Message, WireError>;

/// Declares the closed message catalog: the `Message` envelope, stable type
/// ids, and the type-id → decoder table used for polymorphic decode.
macro_rules! message_catalog {
    ($( $group:ident / $index:literal => $name:ident ),* $(,)?) => {
        /// Top-level message envelope for the rgfx protocol.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $( $name($name), )*
        }

        $(
            impl MessageKind for $name {
                const TYPE_ID: MessageTypeId = MessageTypeId::new(MessageGroup::$group, $index);
                const NAME: &'static str = stringify!($name);
            }

            impl From<$name> for Message {
                fn from(msg: $name) -> Self {
                    Message::$name(msg)
                }
            }

            impl TryFrom<Message> for $name {
                type Error = Message;

                fn try_from(msg: Message) -> Result<Self, Message> {
                    match msg {
                        Message::$name(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )*

        impl Message {
            pub fn type_id(&self) -> MessageTypeId {
                match self {
                    $( Message::$name(_) => <$name as MessageKind>::TYPE_ID, )*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $( Message::$name(_) => <$name as MessageKind>::NAME, )*
                }
            }

            pub(crate) fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
                let bytes = match self {
                    $( Message::$name(inner) => rkyv::to_bytes::<rkyv::rancor::Error>(inner), )*
                };
                bytes
                    .map(|b| b.as_slice().to_vec())
                    .map_err(|e| WireError::Serialization(e.to_string()))
            }
        }

        fn build_factory() -> HashMap<MessageTypeId, DecodeFn> {
            let mut table: HashMap<MessageTypeId, DecodeFn> = HashMap::new();
            $(
                let previous = table.insert(
                    <$name as MessageKind>::TYPE_ID,
                    |bytes: &[u8]| -> Result<Message, WireError> {
                        rkyv::from_bytes::<$name, rkyv::rancor::Error>(bytes)
                            .map(Message::$name)
                            .map_err(|e| WireError::Serialization(e.to_string()))
                    },
                );
                debug_assert!(previous.is_none(), "duplicate message type id");
            )*
            table
        }
    };
}

message_catalog! {
    Core / 0 => DefaultResponse,
    Core / 1 => ErrorResponse,
    Core / 2 => Hello,
    Core / 3 => HelloAck,
    Core / 4 => Log,
    Core / 5 => UploadData,
    Core / 6 => UploadDataAndCopy,
    Core / 7 => Ping,
    Core / 8 => Pong,
    Core / 9 => QueryMetrics,
    Core / 10 => MetricsData,

    Device / 0 => DeviceInit,
    Device / 1 => DeviceInfo,
    Device / 2 => DeviceShutdown,

    Swapchain / 0 => SwapchainCreate,
    Swapchain / 1 => SwapchainCreated,
    Swapchain / 2 => SwapchainAcquire,
    Swapchain / 3 => SwapchainAcquired,
    Swapchain / 4 => SwapchainPresent,

    Frame / 0 => BeginFrame,
    Frame / 1 => FrameBegun,
    Frame / 2 => EndFrame,
    Frame / 3 => FrameEnded,
    Frame / 4 => WaitNextFrame,
    Frame / 5 => FrameWaited,
    Frame / 6 => WaitAll,
    Frame / 7 => CreateBatch,
    Frame / 8 => BatchCreated,
    Frame / 9 => SubmitBatch,
    Frame / 10 => WaitBatch,
    Frame / 11 => SkipBatch,

    Resource / 0 => CreateBuffer,
    Resource / 1 => CreateImage,
    Resource / 2 => LoadPipeline,
    Resource / 3 => CreateSemaphore,
    Resource / 4 => CreateDescriptorSet,
    Resource / 5 => ResourceCreated,
    Resource / 6 => ReleaseResource,
    Resource / 7 => DescribeResource,
    Resource / 8 => ResourceDescription,

    Query / 0 => CreateQueryPool,
    Query / 1 => ReadQueries,
    Query / 2 => QueryResults,

    Descriptor / 0 => DescriptorUpdateFlush,

    CmdBuf / 0 => CmdBufBake,
    CmdBuf / 1 => CmdBufBaked,

    Staging / 0 => StagingGetRanges,
    Staging / 1 => StagingRanges,
    Staging / 2 => StagingFrameStat,
    Staging / 3 => StagingStat,
}

/// Process-wide decoder table, built once.
fn factory() -> &'static HashMap<MessageTypeId, DecodeFn> {
    static FACTORY: OnceLock<HashMap<MessageTypeId, DecodeFn>> = OnceLock::new();
    FACTORY.get_or_init(build_factory)
}

/// Resolve `type_id` and decode `bytes` as that message.
/// Unknown ids yield `WireError::UnknownType` so the caller can skip the frame.
pub fn decode_typed(type_id: MessageTypeId, bytes: &[u8]) -> Result<Message, WireError> {
    let decode = factory()
        .get(&type_id)
        .ok_or(WireError::UnknownType(type_id.0))?;
    // Archived data must be read from an aligned buffer.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    decode(aligned.as_slice())
}

/// True if `type_id` names a message in this build's catalog.
pub fn is_known(type_id: MessageTypeId) -> bool {
    factory().contains_key(&type_id)
}

impl Message {
    /// Messages the host may push outside request/response pairing.
    pub fn is_push(&self) -> bool {
        matches!(self, Message::Log(_) | Message::UploadDataAndCopy(_))
    }

    pub fn error(error: ProtocolError) -> Self {
        Message::ErrorResponse(ErrorResponse { error })
    }

    pub fn ok() -> Self {
        Message::DefaultResponse(DefaultResponse { ok: true })
    }

    pub fn failed() -> Self {
        Message::DefaultResponse(DefaultResponse { ok: false })
    }
}
