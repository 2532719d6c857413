use serde::{Deserialize, Serialize};

// ============================================================================
// Queues and frames
// ============================================================================

/// Hardware queue a batch is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum QueueType {
    Graphics,
    AsyncCompute,
    AsyncTransfer,
}

impl QueueType {
    pub const COUNT: usize = 3;
    pub const ALL: [QueueType; Self::COUNT] =
        [QueueType::Graphics, QueueType::AsyncCompute, QueueType::AsyncTransfer];

    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::AsyncCompute => 1,
            QueueType::AsyncTransfer => 2,
        }
    }
}

/// Monotonic frame counter paired with the number of frames that may be in
/// flight. `index()` selects the per-frame pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct FrameId {
    unique: u64,
    max_frames: u32,
}

impl FrameId {
    pub const MAX_FRAMES_LIMIT: u32 = 4;

    /// The frame before any frame has begun.
    pub fn initial(max_frames: u32) -> Self {
        Self { unique: 0, max_frames: max_frames.clamp(1, Self::MAX_FRAMES_LIMIT) }
    }

    pub fn new(unique: u64, max_frames: u32) -> Self {
        Self { unique, max_frames: max_frames.clamp(1, Self::MAX_FRAMES_LIMIT) }
    }

    pub fn unique(self) -> u64 {
        self.unique
    }

    pub fn max_frames(self) -> u32 {
        self.max_frames
    }

    /// Per-frame pool slot.
    pub fn index(self) -> usize {
        (self.unique % u64::from(self.max_frames)) as usize
    }

    pub fn next(self) -> Self {
        Self { unique: self.unique + 1, ..self }
    }

    /// Frame that occupied the same pool slot one cycle earlier, or `None`
    /// during the first cycle.
    pub fn prev_cycle(self) -> Option<Self> {
        self.unique
            .checked_sub(u64::from(self.max_frames))
            .map(|unique| Self { unique, ..self })
    }

    /// Number of frames between `older` and `self`; zero if `older` is newer.
    pub fn diff(self, older: FrameId) -> u64 {
        self.unique.saturating_sub(older.unique)
    }

    /// Same counter with a different in-flight limit.
    pub fn remap(self, max_frames: u32) -> Self {
        Self::new(self.unique, max_frames)
    }

    /// True once `self` can no longer be in flight when `current` is recording.
    pub fn is_retired_by(self, current: FrameId) -> bool {
        current.diff(self) >= u64::from(current.max_frames)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame#{}[{}]", self.unique, self.index())
    }
}

// ============================================================================
// Resource states and stages
// ============================================================================

/// Logical resource state used on both sides of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceState {
    Unknown,
    General,
    CopySrc,
    CopyDst,
    ClearDst,
    HostRead,
    HostWrite,
    UniformRead,
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    VertexBuffer,
    IndexBuffer,
    IndirectBuffer,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilRead,
    InputAttachment,
    PresentImage,
    AsBuildRead,
    AsBuildWrite,
    RayTracingShaderRead,
}

impl ResourceState {
    /// True if the state implies a write, i.e. a later reader needs a barrier.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::General
                | ResourceState::CopyDst
                | ResourceState::ClearDst
                | ResourceState::HostWrite
                | ResourceState::ShaderWrite
                | ResourceState::ShaderReadWrite
                | ResourceState::ColorAttachment
                | ResourceState::DepthStencilAttachment
                | ResourceState::AsBuildWrite
        )
    }
}

bitflags::bitflags! {
    /// Pipeline stage mask. Records carry the raw bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE       = 1 << 0;
        const DRAW_INDIRECT     = 1 << 1;
        const VERTEX_INPUT      = 1 << 2;
        const VERTEX_SHADER     = 1 << 3;
        const FRAGMENT_SHADER   = 1 << 4;
        const EARLY_FRAGMENT    = 1 << 5;
        const LATE_FRAGMENT     = 1 << 6;
        const COLOR_OUTPUT      = 1 << 7;
        const COMPUTE_SHADER    = 1 << 8;
        const TRANSFER          = 1 << 9;
        const HOST              = 1 << 10;
        const AS_BUILD          = 1 << 11;
        const RAY_TRACING       = 1 << 12;
        const BOTTOM_OF_PIPE    = 1 << 13;
        const ALL_COMMANDS      = 1 << 14;
    }
}

bitflags::bitflags! {
    /// Shader stages visible to push constants and descriptor bindings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX    = 1 << 0;
        const FRAGMENT  = 1 << 1;
        const COMPUTE   = 1 << 2;
        const MESH      = 1 << 3;
        const RAY_GEN   = 1 << 4;
        const MISS      = 1 << 5;
        const HIT       = 1 << 6;
    }
}

// ============================================================================
// Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum PixelFormat {
    R8Unorm,
    RG8Unorm,
    RGBA8Unorm,
    BGRA8Unorm,
    R16Float,
    RGBA16Float,
    R32Float,
    RGBA32Float,
    Depth32Float,
    Depth24Stencil8,
    BC1Unorm,
    BC3Unorm,
    BC7Unorm,
    Astc8x8Unorm,
}

/// Block footprint of a pixel format. Uncompressed formats use 1x1 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub bits_per_block: u32,
    pub block_width: u32,
    pub block_height: u32,
}

impl PixelFormat {
    pub fn info(self) -> FormatInfo {
        let (bits_per_block, block_width, block_height) = match self {
            PixelFormat::R8Unorm => (8, 1, 1),
            PixelFormat::RG8Unorm | PixelFormat::R16Float => (16, 1, 1),
            PixelFormat::RGBA8Unorm
            | PixelFormat::BGRA8Unorm
            | PixelFormat::R32Float
            | PixelFormat::Depth32Float
            | PixelFormat::Depth24Stencil8 => (32, 1, 1),
            PixelFormat::RGBA16Float => (64, 1, 1),
            PixelFormat::RGBA32Float => (128, 1, 1),
            PixelFormat::BC1Unorm => (64, 4, 4),
            PixelFormat::BC3Unorm | PixelFormat::BC7Unorm => (128, 4, 4),
            PixelFormat::Astc8x8Unorm => (128, 8, 8),
        };
        FormatInfo { bits_per_block, block_width, block_height }
    }
}

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Extent3 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3 {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Offset3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Rect2 {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

/// Mip/layer range. `None` in a barrier means the whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ImageSubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageSubresourceRange {
    pub fn mip(level: u32) -> Self {
        Self { base_mip: level, mip_count: 1, base_layer: 0, layer_count: 1 }
    }
}

// ============================================================================
// Copy regions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ImageCopy {
    pub src_mip: u32,
    pub src_layer: u32,
    pub src_offset: Offset3,
    pub dst_mip: u32,
    pub dst_layer: u32,
    pub dst_offset: Offset3,
    pub extent: Extent3,
}

/// Buffer ↔ image copy. `row_length` and `image_height` are in texels; zero
/// means tightly packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub row_length: u32,
    pub image_height: u32,
    pub mip: u32,
    pub layer: u32,
    pub image_offset: Offset3,
    pub image_extent: Extent3,
}

// ============================================================================
// Resource descriptions
// ============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC  = 1 << 0;
        const TRANSFER_DST  = 1 << 1;
        const UNIFORM       = 1 << 2;
        const STORAGE       = 1 << 3;
        const INDEX         = 1 << 4;
        const VERTEX        = 1 << 5;
        const INDIRECT      = 1 << 6;
        const AS_BUILD      = 1 << 7;
        const SHADER_BINDING_TABLE = 1 << 8;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC      = 1 << 0;
        const TRANSFER_DST      = 1 << 1;
        const SAMPLED           = 1 << 2;
        const STORAGE           = 1 << 3;
        const COLOR_ATTACHMENT  = 1 << 4;
        const DEPTH_STENCIL     = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct BufferDesc {
    pub size: u64,
    /// `BufferUsage` bits
    pub usage: u32,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self { size, usage: usage.bits() }
    }

    pub fn usage(&self) -> BufferUsage {
        BufferUsage::from_bits_truncate(self.usage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ImageDesc {
    pub dimension: Extent3,
    pub format: PixelFormat,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// `ImageUsage` bits
    pub usage: u32,
}

impl ImageDesc {
    pub fn new_2d(width: u32, height: u32, format: PixelFormat, usage: ImageUsage) -> Self {
        Self {
            dimension: Extent3::new(width, height, 1),
            format,
            mip_levels: 1,
            array_layers: 1,
            usage: usage.bits(),
        }
    }

    pub fn usage(&self) -> ImageUsage {
        ImageUsage::from_bits_truncate(self.usage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum IndexType {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum QueryKind {
    Timestamp,
    PipelineStatistic,
    AccelStructCompactedSize,
}
