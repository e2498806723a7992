//! Core graphics types shared by the backend and the renderer.

mod buffer;
mod state;

pub use buffer::{BufferDescriptor, BufferUsage, IndexFormat};
pub use state::{QueryKind, ResourceState, Transition};
