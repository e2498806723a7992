//! # Umbra Core
//!
//! Math, bounds, frustum culling and task utilities shared by the Umbra
//! renderer crates.

pub mod bounds;
pub mod compute;
pub mod frustum;
pub mod math;
pub mod pool;
pub mod profiling;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the core version. Call once at startup.
pub fn init() {
    log::info!("Umbra Core v{} initialized", VERSION);
}
