//! Headless test harness for the Prism renderer.
//!
//! Plays the "rendering context collaborator" role for tests: creates a
//! Vulkan instance, device, and queues without any window, wires them into a
//! [`prism_gpu::RenderContext`], and provides buffer readback for round-trip
//! checks.

pub mod harness;

pub use harness::{download_buffer, TestGpu};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("no suitable GPU: {0}")]
    NoDevice(String),
    #[error("vulkan error: {0}")]
    Vulkan(String),
    #[error("render error: {0}")]
    Render(#[from] prism_gpu::RenderError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Install a `tracing` subscriber honoring `RUST_LOG`; repeated calls are
/// no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
