//! The render context shared by every component in this layer.
//!
//! The surrounding application owns instance and device creation; this core
//! only wraps the handles it is given. [`RenderContext`] replaces the usual
//! process-wide globals (device, allocator, global descriptor layout, render
//! pass) with an explicit value passed into every constructor, which keeps
//! the layer testable without hidden state.

use crate::command::{CommandQueue, CommandQueuePool};
use crate::error::Result;
use crate::memory::{Buffer, DeviceAllocator};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Ray-tracing pipeline limits queried from the physical device.
#[derive(Clone, Copy, Debug, Default)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Handles the application provides when constructing a [`RenderContext`].
pub struct RenderContextDesc<'a> {
    pub instance: &'a ash::Instance,
    pub device: Arc<ash::Device>,
    pub physical_device: vk::PhysicalDevice,
    /// Queue family the command queues belong to.
    pub queue_family: u32,
    /// Queues handed to the shared command-queue pool.
    pub queues: Vec<vk::Queue>,
    /// Descriptor-set layout prepended as set 0 of every pipeline layout.
    pub global_descriptor_set_layout: vk::DescriptorSetLayout,
    /// Render pass rasterization pipelines target.
    pub render_pass: vk::RenderPass,
    /// Root directory for resolving shader includes.
    pub content_root: PathBuf,
}

/// Process-wide rendering state: device, allocator, global descriptor
/// layout, render pass, command-queue pool, and ray-tracing loaders.
pub struct RenderContext {
    device: Arc<ash::Device>,
    allocator: Mutex<DeviceAllocator>,
    global_descriptor_set_layout: vk::DescriptorSetLayout,
    render_pass: vk::RenderPass,
    content_root: PathBuf,
    queues: CommandQueuePool,
    accel_loader: ash::khr::acceleration_structure::Device,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    rt_properties: RayTracingProperties,
}

impl RenderContext {
    /// Wrap application-owned handles into a context.
    ///
    /// The instance, device, and physical device must already be initialized;
    /// this call asserts the handles rather than lazily creating anything.
    ///
    /// # Safety
    /// All handles in `desc` must be valid, and the queues must belong to
    /// `desc.queue_family`.
    pub unsafe fn new(desc: RenderContextDesc<'_>) -> Result<Self> {
        assert!(
            desc.physical_device != vk::PhysicalDevice::null(),
            "physical device must be initialized"
        );
        assert!(
            desc.global_descriptor_set_layout != vk::DescriptorSetLayout::null(),
            "global descriptor set layout must be initialized"
        );
        assert!(!desc.queues.is_empty(), "at least one queue is required");

        let allocator = unsafe {
            DeviceAllocator::new(desc.instance, desc.device.clone(), desc.physical_device)?
        };
        let queues = unsafe { CommandQueuePool::new(&desc.device, desc.queue_family, &desc.queues)? };

        let accel_loader =
            ash::khr::acceleration_structure::Device::new(desc.instance, &desc.device);
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(desc.instance, &desc.device);

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
        unsafe {
            desc.instance
                .get_physical_device_properties2(desc.physical_device, &mut properties2);
        }

        let rt_properties = RayTracingProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        };

        tracing::info!(
            queue_count = desc.queues.len(),
            queue_family = desc.queue_family,
            "render context ready"
        );

        Ok(Self {
            device: desc.device,
            allocator: Mutex::new(allocator),
            global_descriptor_set_layout: desc.global_descriptor_set_layout,
            render_pass: desc.render_pass,
            content_root: desc.content_root,
            queues,
            accel_loader,
            rt_loader,
            rt_properties,
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get access to the device memory allocator.
    pub fn allocator(&self) -> &Mutex<DeviceAllocator> {
        &self.allocator
    }

    /// Descriptor-set layout occupying set 0 of every pipeline layout.
    pub fn global_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.global_descriptor_set_layout
    }

    /// Render pass rasterization pipelines are created against.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Root directory for shader include resolution.
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    /// Acceleration-structure extension entry points.
    pub fn accel_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.accel_loader
    }

    /// Ray-tracing pipeline extension entry points.
    pub fn rt_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.rt_loader
    }

    /// Ray-tracing pipeline limits of the physical device.
    pub fn rt_properties(&self) -> RayTracingProperties {
        self.rt_properties
    }

    /// Take a command queue from the shared pool; `None` waits forever.
    pub fn acquire_command_queue(&self, timeout: Option<Duration>) -> Result<CommandQueue> {
        self.queues.acquire(timeout)
    }

    /// Return a command queue to the shared pool; `None` waits forever.
    pub fn release_command_queue(
        &self,
        queue: CommandQueue,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.queues.release(queue, timeout)
    }

    /// Allocate a buffer through the context allocator.
    pub fn allocate_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        self.allocator.lock().allocate_buffer(size, usage, location, name)
    }

    /// Free a buffer through the context allocator.
    pub fn free_buffer(&self, buffer: Buffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle().map_err(|e| {
                crate::error::RenderError::Submission(format!("device wait idle failed: {e}"))
            })?;
        }
        Ok(())
    }

    /// Tear down context-owned resources (queue pool, allocator).
    ///
    /// The device, instance, global descriptor layout, and render pass belong
    /// to the application and are left untouched.
    ///
    /// # Safety
    /// No GPU work may be in flight and every command queue must have been
    /// released.
    pub unsafe fn destroy(&mut self) {
        unsafe { self.queues.destroy(&self.device) };
        self.allocator.lock().shutdown();
    }
}
