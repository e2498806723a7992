//! GPU resource states and query types.

use bitflags::bitflags;

bitflags! {
    /// Resource states used for transitions. Read states may be combined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT = 1 << 0;
        const INDEX = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
        const COPY_DEST = 1 << 3;
        const COPY_SOURCE = 1 << 4;
        const PREDICATION = 1 << 5;
        const INDIRECT_ARGUMENT = 1 << 6;
    }
}

impl ResourceState {
    /// The implicit state every resource starts in.
    pub const COMMON: Self = Self::empty();
}

/// Kind of hardware query in a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Non-zero if any sample passed.
    BinaryOcclusion,
    /// Number of samples passed.
    Occlusion,
}

/// A resource transition recorded on a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Buffer being transitioned.
    pub buffer: u64,
    pub before: ResourceState,
    pub after: ResourceState,
}
