//! Renderer error types.

use std::fmt;
use std::time::Duration;

/// Errors that can occur in the renderer core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The GPU device was lost.
    DeviceLost,
    /// A fence could not be signaled or waited on.
    FenceFailed(String),
    /// The GPU did not reach a frame within the bounded wait.
    FenceTimeout {
        /// Frame the CPU was waiting for.
        frame_id: u64,
        /// How long the CPU waited.
        waited: Duration,
    },
    /// Failed to create a GPU resource.
    ResourceCreationFailed(String),
    /// A command allocator or command list operation failed.
    CommandListFailed(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The renderer has not been initialized yet.
    NotInitialized,
    /// An asynchronously built render stage failed.
    StageConstructionFailed(String),
    /// An invalid parameter was provided.
    InvalidParameter(String),
}

impl RenderError {
    /// Returns `true` for errors that end the rendering session.
    ///
    /// Everything except [`NotInitialized`](Self::NotInitialized) and
    /// [`InvalidParameter`](Self::InvalidParameter) is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotInitialized | Self::InvalidParameter(_))
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::FenceFailed(msg) => write!(f, "fence operation failed: {msg}"),
            Self::FenceTimeout { frame_id, waited } => {
                write!(f, "timed out after {waited:?} waiting for frame {frame_id}")
            }
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::CommandListFailed(msg) => write!(f, "command list operation failed: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::NotInitialized => write!(
                f,
                "renderer not initialized, a manual call to RenderHost::init() is required"
            ),
            Self::StageConstructionFailed(msg) => write!(f, "render stage construction failed: {msg}"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
        }
    }
}

impl std::error::Error for RenderError {}

/// Result alias used throughout the crate.
pub type RenderResult<T> = Result<T, RenderError>;
