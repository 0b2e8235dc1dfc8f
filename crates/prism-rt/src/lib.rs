//! Ray tracing layer for the Prism renderer.
//!
//! Built on `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`:
//! - Bottom- and top-level acceleration-structure construction and builds
//! - Ray-tracing pipeline creation with shader groups
//! - Shader binding table layout

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{
    build_acceleration_structure, build_top_level, destroy_acceleration_structure,
    AabbGeometryDesc, AccelerationStructure, AccelerationStructureDesc, GeometryDesc,
    InstanceDesc, TriangleGeometryDesc,
};
pub use pipeline::{create_ray_tracing_pipeline, ShaderGroup};
pub use sbt::{SbtGroupCounts, ShaderBindingTable};
