use serde::{Deserialize, Serialize};

/// A resource identifier that is only meaningful on the executing (host) side.
/// The host hands these out in construction responses; clients keep them in a
/// translation table and never dereference them locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RemoteId {
    /// Slot index in the host registry
    pub index: u32,
    /// Slot generation at allocation time
    pub generation: u32,
    /// Type tag for validation
    pub resource_type: ResourceType,
}

impl RemoteId {
    pub const INVALID_INDEX: u32 = u32::MAX;

    /// Create an invalid id, returned by failed construction requests.
    pub const fn invalid() -> Self {
        Self {
            index: Self::INVALID_INDEX,
            generation: 0,
            resource_type: ResourceType::None,
        }
    }

    pub const fn new(index: u32, generation: u32, resource_type: ResourceType) -> Self {
        Self { index, generation, resource_type }
    }

    pub fn is_valid(&self) -> bool {
        self.index != Self::INVALID_INDEX && self.resource_type != ResourceType::None
    }

    /// Pack into a single u64 (index:32 | generation:24 | type:8), for logs and
    /// opaque client tokens. The generation is truncated.
    pub fn to_bits(&self) -> u64 {
        (u64::from(self.index) << 32)
            | (u64::from(self.generation & 0x00FF_FFFF) << 8)
            | u64::from(self.resource_type as u8)
    }
}

impl Default for RemoteId {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{:?}#{}v{}", self.resource_type, self.index, self.generation)
        } else {
            f.write_str("<invalid>")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ResourceType {
    None,

    // Memory resources
    Buffer,
    Image,
    AccelerationStructure,

    // Pipeline state
    Pipeline,
    DescriptorSet,
    Sampler,

    // Synchronization and queries
    Semaphore,
    QueryPool,

    // Submission
    CommandBatch,
    CommandBuffer,

    // Presentation
    Swapchain,
}

impl ResourceType {
    const ALL: [ResourceType; 12] = [
        ResourceType::None,
        ResourceType::Buffer,
        ResourceType::Image,
        ResourceType::AccelerationStructure,
        ResourceType::Pipeline,
        ResourceType::DescriptorSet,
        ResourceType::Sampler,
        ResourceType::Semaphore,
        ResourceType::QueryPool,
        ResourceType::CommandBatch,
        ResourceType::CommandBuffer,
        ResourceType::Swapchain,
    ];

    /// Inverse of `as u8`. Unknown tags map to `None`.
    pub fn from_raw(raw: u8) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or(ResourceType::None)
    }
}
