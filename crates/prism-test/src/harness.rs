//! Headless Vulkan bring-up for integration tests.

use crate::{Result, TestError};
use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_gpu::{
    begin_one_time_submit, end_one_time_submit, Buffer, BufferGuard, CommandQueue, RenderContext,
    RenderContextDesc,
};
use std::ffi::CStr;
use std::path::PathBuf;
use std::sync::Arc;

/// How many queues the harness hands to the command-queue pool.
const POOL_QUEUES: u32 = 2;

/// A windowless Vulkan instance/device pair owned by the test process.
///
/// The harness owns everything a [`RenderContext`] borrows: instance, device,
/// queues, the global descriptor-set layout, and a minimal single-subpass
/// render pass. Contexts created from it must be destroyed before the
/// harness is dropped.
pub struct TestGpu {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    queue_family: u32,
    queues: Vec<vk::Queue>,
    global_layout: vk::DescriptorSetLayout,
    render_pass: vk::RenderPass,
    ray_tracing: bool,
}

impl TestGpu {
    /// Bring up a headless device, preferring one with ray-tracing support.
    pub fn new() -> Result<Self> {
        crate::init_logging();

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| TestError::NoDevice(format!("cannot load Vulkan: {e}")))?;

        let app_name = c"prism-test";
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .engine_name(c"prism")
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| TestError::Vulkan(format!("cannot create instance: {e}")))?;

        let (physical_device, queue_family) = unsafe { pick_physical_device(&instance)? };
        let ray_tracing = unsafe { supports_ray_tracing(&instance, physical_device) };

        let device = unsafe {
            create_device(&instance, physical_device, queue_family, ray_tracing)?
        };
        let device = Arc::new(device);

        let queue_count = unsafe { family_queue_count(&instance, physical_device, queue_family) };
        let queues: Vec<vk::Queue> = (0..queue_count.min(POOL_QUEUES))
            .map(|i| unsafe { device.get_device_queue(queue_family, i) })
            .collect();

        let global_layout = unsafe { create_global_layout(&device)? };
        let render_pass = unsafe { create_render_pass(&device)? };

        tracing::info!(queue_family, ray_tracing, "headless test device ready");

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue_family,
            queues,
            global_layout,
            render_pass,
            ray_tracing,
        })
    }

    /// Whether the device exposes the acceleration-structure and ray-tracing
    /// pipeline extensions.
    pub fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing
    }

    /// Build a [`RenderContext`] against this device.
    pub fn render_context(&self) -> Result<RenderContext> {
        let ctx = unsafe {
            RenderContext::new(RenderContextDesc {
                instance: &self.instance,
                device: self.device.clone(),
                physical_device: self.physical_device,
                queue_family: self.queue_family,
                queues: self.queues.clone(),
                global_descriptor_set_layout: self.global_layout,
                render_pass: self.render_pass,
                content_root: PathBuf::from("."),
            })?
        };
        Ok(ctx)
    }
}

impl Drop for TestGpu {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_render_pass(self.render_pass, None);
            self.device
                .destroy_descriptor_set_layout(self.global_layout, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Copy a device buffer into host memory through a one-shot readback copy.
///
/// `src` must have been created with `TRANSFER_SRC` usage.
pub fn download_buffer(
    ctx: &RenderContext,
    queue: &CommandQueue,
    src: &Buffer,
) -> Result<Vec<u8>> {
    let mut readback = BufferGuard::new(
        ctx,
        ctx.allocate_buffer(
            src.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback",
        )?,
    );

    let cmd = begin_one_time_submit(ctx.device(), queue.pool)?;
    let region = vk::BufferCopy::default().size(src.size);
    unsafe {
        ctx.device()
            .cmd_copy_buffer(cmd, src.buffer, readback.buffer, &[region]);
    }
    end_one_time_submit(ctx.device(), cmd, queue.pool, queue.queue, queue.fence)?;

    let mapped = readback.map()?;
    Ok(mapped.to_vec())
}

unsafe fn pick_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| TestError::Vulkan(format!("cannot enumerate devices: {e}")))?;

    let mut best: Option<(vk::PhysicalDevice, u32, i32)> = None;
    for device in devices {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let Some(family) = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        else {
            continue;
        };

        let properties = unsafe { instance.get_physical_device_properties(device) };
        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 10,
        };
        if unsafe { supports_ray_tracing(instance, device) } {
            score += 500;
        }

        if best.map_or(true, |(_, _, s)| score > s) {
            best = Some((device, family as u32, score));
        }
    }

    best.map(|(device, family, _)| (device, family))
        .ok_or_else(|| TestError::NoDevice("no device with a graphics queue".to_string()))
}

unsafe fn supports_ray_tracing(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) })
    else {
        return false;
    };
    let has = |name: &CStr| {
        extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
    };
    has(ash::khr::acceleration_structure::NAME)
        && has(ash::khr::ray_tracing_pipeline::NAME)
        && has(ash::khr::deferred_host_operations::NAME)
}

unsafe fn family_queue_count(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    family: u32,
) -> u32 {
    (unsafe { instance.get_physical_device_queue_family_properties(device) })[family as usize]
        .queue_count
}

unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    ray_tracing: bool,
) -> Result<ash::Device> {
    let queue_count =
        unsafe { family_queue_count(instance, physical_device, queue_family) }.min(POOL_QUEUES);
    let priorities = vec![1.0_f32; queue_count as usize];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities);

    let mut extensions: Vec<*const i8> = Vec::new();
    if ray_tracing {
        extensions.push(ash::khr::acceleration_structure::NAME.as_ptr());
        extensions.push(ash::khr::ray_tracing_pipeline::NAME.as_ptr());
        extensions.push(ash::khr::deferred_host_operations::NAME.as_ptr());
    }

    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true);

    let mut accel_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
        .ray_tracing_pipeline(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2);
    if ray_tracing {
        features2 = features2
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);
    }

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extensions)
        .push_next(&mut features2);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(|e| TestError::Vulkan(format!("cannot create device: {e}")))
}

unsafe fn create_global_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::ALL);

    let layout_info =
        vk::DescriptorSetLayoutCreateInfo::default().bindings(std::slice::from_ref(&binding));

    unsafe { device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(|e| TestError::Vulkan(format!("cannot create global layout: {e}")))
}

unsafe fn create_render_pass(device: &ash::Device) -> Result<vk::RenderPass> {
    let attachment = vk::AttachmentDescription::default()
        .format(vk::Format::R8G8B8A8_UNORM)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

    let color_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref));

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass));

    unsafe { device.create_render_pass(&create_info, None) }
        .map_err(|e| TestError::Vulkan(format!("cannot create render pass: {e}")))
}
