//! Vulkan resource layer for the Prism renderer.
//!
//! This crate provides:
//! - GPU memory allocation via gpu-allocator, with staged uploads
//! - Runtime GLSL to SPIR-V shader compilation via shaderc
//! - Pipeline layout and rasterization pipeline creation
//! - One-shot command submission and the shared command-queue pool
//!
//! Everything operates against an explicit [`RenderContext`] the application
//! constructs from its own instance and device; nothing here creates or
//! destroys that outer state.

pub mod command;
pub mod context;
pub mod error;
pub mod guard;
pub mod memory;
pub mod pipeline;
pub mod shader;

pub use command::{
    begin_one_time_submit, end_one_time_submit, end_one_time_submit_with_timeout, CommandQueue,
    CommandQueuePool,
};
pub use context::{RayTracingProperties, RenderContext, RenderContextDesc};
pub use error::{RenderError, Result};
pub use guard::BufferGuard;
pub use memory::{upload_buffer, Buffer, DeviceAllocator};
pub use pipeline::{
    create_pipeline_layout, create_rasterization_pipeline, destroy_pipeline, shader_stage_infos,
    FrameConstants, Pipeline, RasterizationPipelineDesc,
};
pub use shader::{compile_glsl, Shader};
