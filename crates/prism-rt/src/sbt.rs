//! Shader binding table construction.
//!
//! The SBT is a host-visible buffer of shader-group handles laid out with
//! the device's handle and base alignments, split into the raygen, miss, hit,
//! and (empty) callable regions that `vkCmdTraceRaysKHR` consumes.

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_gpu::{Buffer, Pipeline, RenderContext, RenderError, Result};

/// How many shader groups of each kind the pipeline was created with, in
/// pipeline group order: raygen first, then miss, then hit groups.
#[derive(Clone, Copy, Debug)]
pub struct SbtGroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
}

impl SbtGroupCounts {
    fn total(self) -> u32 {
        self.raygen + self.miss + self.hit
    }
}

/// Shader binding table for a ray-tracing pipeline.
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Fetch the pipeline's group handles and lay them out into an SBT
    /// buffer.
    ///
    /// Errors: [`RenderError::ObjectCreation`] if the handles cannot be
    /// fetched, [`RenderError::AllocationFailed`] / [`RenderError::MapFailed`]
    /// for the buffer.
    pub fn new(ctx: &RenderContext, pipeline: &Pipeline, counts: SbtGroupCounts) -> Result<Self> {
        // One raygen record per trace call; the raygen region size must equal
        // its stride.
        assert_eq!(counts.raygen, 1, "exactly one ray-generation group");

        let props = ctx.rt_properties();
        let handle_size = props.shader_group_handle_size;
        let aligned_handle = align_up(handle_size, props.shader_group_handle_alignment);
        let base_alignment = props.shader_group_base_alignment;

        let raygen_size = align_up(aligned_handle * counts.raygen, base_alignment);
        let miss_size = align_up(aligned_handle * counts.miss, base_alignment);
        let hit_size = align_up(aligned_handle * counts.hit, base_alignment);
        let sbt_size = raygen_size + miss_size + hit_size;

        let group_count = counts.total();
        let handles = unsafe {
            ctx.rt_loader()
                .get_ray_tracing_shader_group_handles(
                    pipeline.pipeline,
                    0,
                    group_count,
                    (handle_size * group_count) as usize,
                )
                .map_err(|e| {
                    RenderError::ObjectCreation(format!("cannot fetch shader group handles: {e}"))
                })?
        };

        let mut buffer = ctx.allocate_buffer(
            u64::from(sbt_size),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        )?;

        let write = |mapped: &mut [u8]| {
            let handle = handle_size as usize;
            let mut src_group = 0usize;
            for (count, region_offset) in [
                (counts.raygen, 0usize),
                (counts.miss, raygen_size as usize),
                (counts.hit, (raygen_size + miss_size) as usize),
            ] {
                for i in 0..count as usize {
                    let src = src_group * handle;
                    let dst = region_offset + i * aligned_handle as usize;
                    mapped[dst..dst + handle].copy_from_slice(&handles[src..src + handle]);
                    src_group += 1;
                }
            }
        };

        match buffer.map() {
            Ok(mapped) => write(mapped),
            Err(e) => {
                ctx.free_buffer(buffer)?;
                return Err(e);
            }
        }

        let base_address = buffer.device_address(ctx.device());

        let raygen_region = vk::StridedDeviceAddressRegionKHR {
            device_address: base_address,
            stride: u64::from(aligned_handle),
            size: u64::from(aligned_handle),
        };
        let miss_region = vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + u64::from(raygen_size),
            stride: u64::from(aligned_handle),
            size: u64::from(miss_size),
        };
        let hit_region = vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + u64::from(raygen_size) + u64::from(miss_size),
            stride: u64::from(aligned_handle),
            size: u64::from(hit_size),
        };
        let callable_region = vk::StridedDeviceAddressRegionKHR::default();

        Ok(Self {
            buffer,
            raygen_region,
            miss_region,
            hit_region,
            callable_region,
        })
    }

    /// Free the SBT buffer.
    ///
    /// # Safety
    /// No trace call referencing these regions may still be in flight.
    pub unsafe fn destroy(self, ctx: &RenderContext) -> Result<()> {
        ctx.free_buffer(self.buffer)
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_alignment() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
    }

    #[test]
    fn counts_total() {
        let counts = SbtGroupCounts {
            raygen: 1,
            miss: 2,
            hit: 3,
        };
        assert_eq!(counts.total(), 6);
    }
}
