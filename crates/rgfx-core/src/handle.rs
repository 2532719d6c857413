use rgfx_protocol::{RemoteId, ResourceType};

/// Opaque typed reference to a registry slot. Valid only while `generation`
/// matches the slot's current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
    kind: ResourceType,
}

impl Handle {
    const INVALID_INDEX: u32 = u32::MAX;

    pub(crate) const fn new(index: u32, generation: u32, kind: ResourceType) -> Self {
        Self { index, generation, kind }
    }

    pub const fn invalid() -> Self {
        Self { index: Self::INVALID_INDEX, generation: 0, kind: ResourceType::None }
    }

    pub fn is_valid(&self) -> bool {
        self.index != Self::INVALID_INDEX
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn kind(&self) -> ResourceType {
        self.kind
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::invalid()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{:?}#{}v{}", self.kind, self.index, self.generation)
        } else {
            f.write_str("<invalid>")
        }
    }
}

/// Host-side handles travel unchanged as remote ids.
impl From<Handle> for RemoteId {
    fn from(h: Handle) -> Self {
        if h.is_valid() {
            RemoteId::new(h.index, h.generation, h.kind)
        } else {
            RemoteId::invalid()
        }
    }
}

/// Interpret a remote id as a host registry handle. Liveness is the
/// registry's call; this only rebuilds the triple.
impl From<RemoteId> for Handle {
    fn from(id: RemoteId) -> Self {
        if id.is_valid() {
            Handle::new(id.index, id.generation, id.resource_type)
        } else {
            Handle::invalid()
        }
    }
}
