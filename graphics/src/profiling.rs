//! Profiling support via Tracy.
//!
//! Re-exports the CPU profiling macros of [`umbra_core::profiling`]. Enable
//! them with the `profiling` feature:
//!
//! ```toml
//! [dependencies]
//! umbra-graphics = { version = "0.1", features = ["profiling"] }
//! ```
//!
//! Frame boundaries are marked by
//! [`FrameVersioning::on_frame_finish`](crate::FrameVersioning::on_frame_finish);
//! allocator and query heap growth and the adaptive frame latency are
//! plotted.

pub use umbra_core::profiling::{
    frame_mark, profile_function, profile_plot, profile_scope, set_thread_name,
};
