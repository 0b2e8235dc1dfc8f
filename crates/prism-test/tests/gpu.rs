//! Integration tests that exercise the resource core against a live device.
//!
//! These are ignored by default; run them with `cargo test -- --ignored` on a
//! machine with a Vulkan driver.

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_gpu::{
    create_rasterization_pipeline, destroy_pipeline, upload_buffer, RasterizationPipelineDesc,
    RenderError, Shader,
};
use prism_rt::{
    build_acceleration_structure, build_top_level, create_ray_tracing_pipeline,
    destroy_acceleration_structure, AabbGeometryDesc, AccelerationStructure, GeometryDesc,
    InstanceDesc, SbtGroupCounts, ShaderBindingTable, ShaderGroup,
};
use prism_test::{download_buffer, TestGpu};
use std::time::Duration;

const QUEUE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

const TRIVIAL_VERTEX: &str = "#version 450\nvoid main() { gl_Position = vec4(0.0); }\n";
const TRIVIAL_FRAGMENT: &str =
    "#version 450\nlayout(location = 0) out vec4 color;\nvoid main() { color = vec4(1.0); }\n";

#[test]
#[ignore = "requires a Vulkan device"]
fn buffer_allocation_invariants() {
    let gpu = TestGpu::new().unwrap();
    let mut ctx = gpu.render_context().unwrap();

    let buffer = ctx
        .allocate_buffer(
            256,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
            "invariants",
        )
        .unwrap();
    assert!(buffer.is_valid());
    assert_eq!(buffer.size, 256);

    ctx.free_buffer(buffer).unwrap();
    unsafe { ctx.destroy() };
}

#[test]
#[ignore = "requires a Vulkan device"]
fn reallocate_within_capacity_is_identity() {
    let gpu = TestGpu::new().unwrap();
    let mut ctx = gpu.render_context().unwrap();

    let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
    let buffer = ctx
        .allocate_buffer(1024, usage, MemoryLocation::GpuOnly, "grow")
        .unwrap();
    let original_handle = buffer.buffer;

    let same = ctx
        .allocator()
        .lock()
        .reallocate_buffer(buffer, 512, usage, MemoryLocation::GpuOnly, "grow")
        .unwrap();
    assert_eq!(same.buffer, original_handle);
    assert_eq!(same.size, 1024);

    let grown = ctx
        .allocator()
        .lock()
        .reallocate_buffer(same, 4096, usage, MemoryLocation::GpuOnly, "grow")
        .unwrap();
    assert_ne!(grown.buffer, original_handle);
    assert_eq!(grown.size, 4096);

    ctx.free_buffer(grown).unwrap();
    unsafe { ctx.destroy() };
}

#[test]
#[ignore = "requires a Vulkan device"]
fn upload_round_trips_byte_identical() {
    let gpu = TestGpu::new().unwrap();
    let mut ctx = gpu.render_context().unwrap();
    let queue = ctx.acquire_command_queue(QUEUE_TIMEOUT).unwrap();

    for size in [1usize, 64, 4096] {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let buffer = upload_buffer(
            &ctx,
            &queue,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
            &data,
            "round_trip",
        )
        .unwrap();
        assert_eq!(buffer.size, size as u64);

        let readback = download_buffer(&ctx, &queue, &buffer).unwrap();
        assert_eq!(readback, data, "mismatch at size {size}");

        ctx.free_buffer(buffer).unwrap();
    }

    ctx.release_command_queue(queue, QUEUE_TIMEOUT).unwrap();
    unsafe { ctx.destroy() };
}

#[test]
#[ignore = "requires a Vulkan device"]
fn malformed_shader_reports_compile_error() {
    let gpu = TestGpu::new().unwrap();
    let mut ctx = gpu.render_context().unwrap();

    let err = Shader::from_source(
        &ctx,
        "#version 450\nvoid main() { gl_Position = vec4(0.0);\n",
        vk::ShaderStageFlags::VERTEX,
        &[],
    )
    .unwrap_err();

    match err {
        RenderError::ShaderCompilation(diagnostics) => assert!(!diagnostics.is_empty()),
        other => panic!("expected compile error, got {other}"),
    }

    unsafe { ctx.destroy() };
}

#[test]
#[ignore = "requires a Vulkan device"]
fn rasterization_pipeline_postconditions() {
    let gpu = TestGpu::new().unwrap();
    let mut ctx = gpu.render_context().unwrap();

    let vertex =
        Shader::from_source(&ctx, TRIVIAL_VERTEX, vk::ShaderStageFlags::VERTEX, &[]).unwrap();
    let fragment =
        Shader::from_source(&ctx, TRIVIAL_FRAGMENT, vk::ShaderStageFlags::FRAGMENT, &[]).unwrap();

    let shaders = [vertex, fragment];
    let blend = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)];
    let dynamic = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

    let desc = RasterizationPipelineDesc {
        shaders: &shaders,
        color_blend_attachments: &blend,
        dynamic_states: &dynamic,
        ..Default::default()
    };

    let pipeline = create_rasterization_pipeline(&ctx, &desc).unwrap();
    assert_ne!(pipeline.layout, vk::PipelineLayout::null());
    assert_ne!(pipeline.pipeline, vk::Pipeline::null());

    unsafe {
        destroy_pipeline(&ctx, pipeline);
        let [vertex, fragment] = shaders;
        vertex.destroy(&ctx);
        fragment.destroy(&ctx);
        ctx.destroy();
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn acceleration_structures_build_and_tear_down() {
    let gpu = TestGpu::new().unwrap();
    if !gpu.supports_ray_tracing() {
        eprintln!("skipping: device lacks ray tracing extensions");
        return;
    }
    let mut ctx = gpu.render_context().unwrap();
    let queue = ctx.acquire_command_queue(QUEUE_TIMEOUT).unwrap();

    // One unit AABB as procedural geometry.
    let aabb: [f32; 6] = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
    let aabb_buffer = upload_buffer(
        &ctx,
        &queue,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        bytemuck::cast_slice(aabb.as_slice()),
        "aabb",
    )
    .unwrap();

    let geometry = GeometryDesc::Aabbs(AabbGeometryDesc {
        data_address: aabb_buffer.device_address(ctx.device()),
        stride: std::mem::size_of::<vk::AabbPositionsKHR>() as u64,
        primitive_count: 1,
    });

    let blas = AccelerationStructure::bottom_level(&ctx, vec![geometry], None).unwrap();
    assert_ne!(blas.device_address, 0);
    build_acceleration_structure(&ctx, &blas, &queue, None).unwrap();

    let tlas = AccelerationStructure::top_level(&ctx, 1, None).unwrap();
    assert_ne!(tlas.device_address, 0);

    let instance = InstanceDesc {
        blas_address: blas.device_address,
        ..Default::default()
    };
    build_top_level(&ctx, &tlas, &queue, &[instance]).unwrap();

    unsafe {
        destroy_acceleration_structure(&ctx, tlas).unwrap();
        destroy_acceleration_structure(&ctx, blas).unwrap();
    }
    ctx.free_buffer(aabb_buffer).unwrap();

    ctx.release_command_queue(queue, QUEUE_TIMEOUT).unwrap();
    unsafe { ctx.destroy() };
}

#[test]
#[ignore = "requires a Vulkan device"]
fn ray_tracing_pipeline_and_binding_table() {
    let gpu = TestGpu::new().unwrap();
    if !gpu.supports_ray_tracing() {
        eprintln!("skipping: device lacks ray tracing extensions");
        return;
    }
    let mut ctx = gpu.render_context().unwrap();

    let raygen = Shader::from_source(
        &ctx,
        "#version 460\n#extension GL_EXT_ray_tracing : require\nvoid main() {}\n",
        vk::ShaderStageFlags::RAYGEN_KHR,
        &[],
    )
    .unwrap();
    let miss = Shader::from_source(
        &ctx,
        "#version 460\n#extension GL_EXT_ray_tracing : require\nvoid main() {}\n",
        vk::ShaderStageFlags::MISS_KHR,
        &[],
    )
    .unwrap();

    let shaders = [raygen, miss];
    let groups = [ShaderGroup::general(0), ShaderGroup::general(1)];

    let pipeline = create_ray_tracing_pipeline(&ctx, &shaders, &groups, &[], 1).unwrap();
    assert_ne!(pipeline.layout, vk::PipelineLayout::null());
    assert_ne!(pipeline.pipeline, vk::Pipeline::null());

    let sbt = ShaderBindingTable::new(
        &ctx,
        &pipeline,
        SbtGroupCounts {
            raygen: 1,
            miss: 1,
            hit: 0,
        },
    )
    .unwrap();
    assert_ne!(sbt.raygen_region.device_address, 0);
    assert_eq!(sbt.raygen_region.size, sbt.raygen_region.stride);

    unsafe {
        sbt.destroy(&ctx).unwrap();
        destroy_pipeline(&ctx, pipeline);
        let [raygen, miss] = shaders;
        raygen.destroy(&ctx);
        miss.destroy(&ctx);
        ctx.destroy();
    }
}
