//! Acceleration structure construction for hardware ray tracing.
//!
//! Bottom-level structures are built from geometry (triangle meshes or
//! procedural AABBs), top-level structures from instance transforms that
//! reference bottom-level structures. Construction and build are separate
//! steps: construction sizes and creates the structure object, build records
//! a one-shot command with dedicated scratch memory and blocks until the GPU
//! finishes.

use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use prism_gpu::command;
use prism_gpu::{Buffer, BufferGuard, CommandQueue, RenderContext, RenderError, Result};

/// Triangle-mesh geometry for a bottom-level structure.
///
/// Addresses refer to buffers created with
/// `vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR`.
#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometryDesc {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_format: vk::Format,
    pub vertex_stride: u64,
    /// Highest vertex index addressable in the vertex buffer.
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub primitive_count: u32,
}

/// Procedural axis-aligned bounding boxes for a bottom-level structure.
///
/// Each entry is a `vk::AabbPositionsKHR` at `stride` spacing; intersection
/// is handled by a custom intersection shader.
#[derive(Clone, Copy, Debug)]
pub struct AabbGeometryDesc {
    pub data_address: vk::DeviceAddress,
    pub stride: u64,
    pub primitive_count: u32,
}

/// One geometry entry of a bottom-level structure.
#[derive(Clone, Copy, Debug)]
pub enum GeometryDesc {
    Triangles(TriangleGeometryDesc),
    Aabbs(AabbGeometryDesc),
}

impl GeometryDesc {
    /// Number of primitives this geometry contributes to the build.
    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.primitive_count,
            Self::Aabbs(a) => a.primitive_count,
        }
    }

    fn to_vk(self) -> vk::AccelerationStructureGeometryKHR<'static> {
        match self {
            Self::Triangles(t) => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(t.vertex_format)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: t.vertex_address,
                        })
                        .vertex_stride(t.vertex_stride)
                        .max_vertex(t.max_vertex)
                        .index_type(t.index_type)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: t.index_address,
                        }),
                }),
            Self::Aabbs(a) => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: a.data_address,
                        })
                        .stride(a.stride),
                }),
        }
    }
}

/// Type-tagged build description an acceleration structure is created from.
#[derive(Clone, Debug)]
pub enum AccelerationStructureDesc {
    /// Built from geometry.
    BottomLevel { geometries: Vec<GeometryDesc> },
    /// Built from instance transforms referencing bottom-level structures.
    TopLevel { instance_count: u32 },
}

impl AccelerationStructureDesc {
    fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::BottomLevel { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::TopLevel { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    fn debug_name(&self) -> &'static str {
        match self {
            Self::BottomLevel { .. } => "blas_backing",
            Self::TopLevel { .. } => "tlas_backing",
        }
    }

    /// Geometry entries for a size query or build. `instance_address` is only
    /// consulted for top-level structures and may be zero when sizing.
    fn vk_geometries(
        &self,
        instance_address: vk::DeviceAddress,
    ) -> Vec<vk::AccelerationStructureGeometryKHR<'static>> {
        match self {
            Self::BottomLevel { geometries } => {
                geometries.iter().map(|g| g.to_vk()).collect()
            }
            Self::TopLevel { .. } => {
                vec![vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                            .array_of_pointers(false)
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: instance_address,
                            }),
                    })]
            }
        }
    }

    /// Per-geometry primitive counts matching [`Self::vk_geometries`].
    pub fn primitive_counts(&self) -> Vec<u32> {
        match self {
            Self::BottomLevel { geometries } => {
                geometries.iter().map(GeometryDesc::primitive_count).collect()
            }
            Self::TopLevel { instance_count } => vec![*instance_count],
        }
    }
}

/// One instance of a top-level structure.
#[derive(Clone, Copy, Debug)]
pub struct InstanceDesc {
    pub transform: Mat4,
    /// Application-defined index, low 24 bits.
    pub custom_index: u32,
    pub mask: u8,
    /// Shader-binding-table record offset, low 24 bits.
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    /// Device address of the referenced bottom-level structure.
    pub blas_address: vk::DeviceAddress,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
            blas_address: 0,
        }
    }
}

impl InstanceDesc {
    /// Pack into the device instance layout (row-major 3x4 transform).
    pub fn to_vk(&self) -> vk::AccelerationStructureInstanceKHR {
        let mut matrix = [0.0f32; 12];
        for row in 0..3 {
            matrix[row * 4..row * 4 + 4].copy_from_slice(&self.transform.row(row).to_array());
        }

        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(
                self.custom_index,
                self.mask,
            ),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.sbt_record_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

/// A constructed (not necessarily built) acceleration structure.
///
/// Owns the structure object, its backing allocation, its 64-bit device
/// address, and the description it was created from. The device address is
/// non-zero for every successfully constructed structure.
pub struct AccelerationStructure {
    pub structure: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub desc: AccelerationStructureDesc,
}

impl AccelerationStructure {
    /// Create a structure from a type-tagged description.
    ///
    /// Queries the structure's storage requirement, allocates device-local
    /// backing memory (or `compacted_size`, when a compaction pass already
    /// measured the structure), creates the structure object on that memory,
    /// and fetches its device address. Failure at any step frees everything
    /// the earlier steps created.
    ///
    /// Errors: [`RenderError::AllocationFailed`],
    /// [`RenderError::ObjectCreation`].
    pub fn create(
        ctx: &RenderContext,
        desc: AccelerationStructureDesc,
        compacted_size: Option<u64>,
    ) -> Result<Self> {
        let sizes = query_build_sizes(ctx, &desc, 0);
        let size = compacted_size.unwrap_or(sizes.acceleration_structure_size);

        let backing = BufferGuard::new(
            ctx,
            ctx.allocate_buffer(
                size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
                desc.debug_name(),
            )?,
        );

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(backing.buffer)
            .offset(0)
            .size(size)
            .ty(desc.ty());

        // The guard frees the backing buffer if the device rejects the
        // structure object.
        let structure = unsafe {
            ctx.accel_loader()
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| {
                    RenderError::ObjectCreation(format!(
                        "cannot create acceleration structure: {e}"
                    ))
                })?
        };

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(structure);
        let device_address = unsafe {
            ctx.accel_loader()
                .get_acceleration_structure_device_address(&address_info)
        };
        debug_assert!(device_address != 0);

        tracing::debug!(ty = ?desc.ty(), size, "created acceleration structure");
        Ok(Self {
            structure,
            buffer: backing.into_inner(),
            device_address,
            desc,
        })
    }

    /// Create a top-level structure sized for `instance_count` instances.
    pub fn top_level(
        ctx: &RenderContext,
        instance_count: u32,
        compacted_size: Option<u64>,
    ) -> Result<Self> {
        Self::create(
            ctx,
            AccelerationStructureDesc::TopLevel { instance_count },
            compacted_size,
        )
    }

    /// Create a bottom-level structure from a list of geometry descriptors.
    pub fn bottom_level(
        ctx: &RenderContext,
        geometries: Vec<GeometryDesc>,
        compacted_size: Option<u64>,
    ) -> Result<Self> {
        Self::create(
            ctx,
            AccelerationStructureDesc::BottomLevel { geometries },
            compacted_size,
        )
    }
}

fn query_build_sizes(
    ctx: &RenderContext,
    desc: &AccelerationStructureDesc,
    instance_address: vk::DeviceAddress,
) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
    let geometries = desc.vk_geometries(instance_address);
    let counts = desc.primitive_counts();

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(desc.ty())
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        ctx.accel_loader().get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &counts,
            &mut sizes,
        );
    }
    sizes
}

/// Build a constructed acceleration structure on the GPU.
///
/// The build-scratch requirement is queried separately from the structure's
/// own storage; a scratch buffer of that size is allocated for the build and
/// released whether the submission succeeds or fails. `instance_buffer`
/// supplies the packed instance array for top-level builds and is ignored
/// for bottom-level ones. Blocks until the queue's fence signals.
///
/// Errors: [`RenderError::AllocationFailed`], [`RenderError::Submission`],
/// [`RenderError::InvalidState`].
pub fn build_acceleration_structure(
    ctx: &RenderContext,
    structure: &AccelerationStructure,
    queue: &CommandQueue,
    instance_buffer: Option<&Buffer>,
) -> Result<()> {
    assert!(
        structure.structure != vk::AccelerationStructureKHR::null(),
        "acceleration structure must be constructed before building"
    );

    let instance_address = match (&structure.desc, instance_buffer) {
        (AccelerationStructureDesc::TopLevel { .. }, Some(buffer)) => {
            buffer.device_address(ctx.device())
        }
        (AccelerationStructureDesc::TopLevel { .. }, None) => {
            return Err(RenderError::InvalidState(
                "top-level build requires an instance buffer".to_string(),
            ));
        }
        (AccelerationStructureDesc::BottomLevel { .. }, _) => 0,
    };

    let sizes = query_build_sizes(ctx, &structure.desc, instance_address);

    // Scratch is working memory for the build only; the guard releases it on
    // every path.
    let scratch = BufferGuard::new(
        ctx,
        ctx.allocate_buffer(
            sizes.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "as_scratch",
        )?,
    );
    let scratch_address = scratch.device_address(ctx.device());

    let cmd = command::begin_one_time_submit(ctx.device(), queue.pool)?;

    let geometries = structure.desc.vk_geometries(instance_address);
    let counts = structure.desc.primitive_counts();

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure.desc.ty())
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .dst_acceleration_structure(structure.structure)
        .geometries(&geometries)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });

    let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = counts
        .iter()
        .map(|&count| {
            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count)
        })
        .collect();

    unsafe {
        ctx.accel_loader()
            .cmd_build_acceleration_structures(cmd, &[build_info], &[&ranges]);
    }

    command::end_one_time_submit(ctx.device(), cmd, queue.pool, queue.queue, queue.fence)?;

    tracing::debug!(ty = ?structure.desc.ty(), "built acceleration structure");
    Ok(())
}

/// Upload `instances` into a fresh host-visible buffer and build the
/// top-level structure from them.
///
/// The instance buffer is freed again before returning, on success and
/// failure alike.
pub fn build_top_level(
    ctx: &RenderContext,
    structure: &AccelerationStructure,
    queue: &CommandQueue,
    instances: &[InstanceDesc],
) -> Result<()> {
    assert!(!instances.is_empty(), "instance list must be non-empty");

    let packed: Vec<vk::AccelerationStructureInstanceKHR> =
        instances.iter().map(InstanceDesc::to_vk).collect();
    let stride = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

    let mut instance_buffer = BufferGuard::new(
        ctx,
        ctx.allocate_buffer(
            (packed.len() * stride) as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "tlas_instances",
        )?,
    );

    let mapped = instance_buffer.map()?;
    // The packed instances are plain device-layout structs; copy them as raw
    // bytes.
    let bytes = unsafe {
        std::slice::from_raw_parts(packed.as_ptr().cast::<u8>(), packed.len() * stride)
    };
    mapped[..bytes.len()].copy_from_slice(bytes);

    build_acceleration_structure(ctx, structure, queue, Some(&instance_buffer))
}

/// Destroy a structure and free its backing allocation.
///
/// Takes the structure by value so a destroyed structure cannot be reused.
///
/// # Safety
/// The structure must not be referenced by any in-flight GPU work or by a
/// top-level structure that is still alive.
pub unsafe fn destroy_acceleration_structure(
    ctx: &RenderContext,
    structure: AccelerationStructure,
) -> Result<()> {
    unsafe {
        ctx.accel_loader()
            .destroy_acceleration_structure(structure.structure, None);
    }
    ctx.free_buffer(structure.buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aabb(count: u32) -> GeometryDesc {
        GeometryDesc::Aabbs(AabbGeometryDesc {
            data_address: 0x1000,
            stride: std::mem::size_of::<vk::AabbPositionsKHR>() as u64,
            primitive_count: count,
        })
    }

    #[test]
    fn bottom_level_counts_follow_geometries() {
        let desc = AccelerationStructureDesc::BottomLevel {
            geometries: vec![
                aabb(1),
                GeometryDesc::Triangles(TriangleGeometryDesc {
                    vertex_address: 0x2000,
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_stride: 12,
                    max_vertex: 2,
                    index_address: 0x3000,
                    index_type: vk::IndexType::UINT32,
                    primitive_count: 7,
                }),
            ],
        };

        assert_eq!(desc.primitive_counts(), vec![1, 7]);
        assert_eq!(desc.ty(), vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let geometries = desc.vk_geometries(0);
        assert_eq!(geometries.len(), 2);
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::AABBS);
        assert_eq!(geometries[1].geometry_type, vk::GeometryTypeKHR::TRIANGLES);
    }

    #[test]
    fn top_level_counts_are_the_instance_count() {
        let desc = AccelerationStructureDesc::TopLevel { instance_count: 12 };
        assert_eq!(desc.primitive_counts(), vec![12]);

        let geometries = desc.vk_geometries(0xABCD);
        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].geometry_type, vk::GeometryTypeKHR::INSTANCES);
    }

    #[test]
    fn instance_packs_to_device_layout() {
        assert_eq!(
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            64
        );

        let instance = InstanceDesc {
            transform: Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)),
            custom_index: 5,
            mask: 0xF0,
            sbt_record_offset: 3,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address: 0xDEAD_BEEF,
        }
        .to_vk();

        // Row-major 3x4: translation sits in the last column of each row.
        assert_eq!(instance.transform.matrix[3], 1.0);
        assert_eq!(instance.transform.matrix[7], 2.0);
        assert_eq!(instance.transform.matrix[11], 3.0);

        assert_eq!(instance.instance_custom_index_and_mask.low_24(), 5);
        assert_eq!(instance.instance_custom_index_and_mask.high_8(), 0xF0);
        assert_eq!(
            instance
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            3
        );
        // The reference is a device-address union on the device side.
        assert_eq!(
            unsafe { instance.acceleration_structure_reference.device_handle },
            0xDEAD_BEEF
        );
    }

    #[test]
    fn default_instance_is_visible_everywhere() {
        let instance = InstanceDesc::default();
        assert_eq!(instance.mask, 0xFF);
        assert_eq!(instance.custom_index, 0);
        assert_eq!(instance.transform, Mat4::IDENTITY);
    }
}
