//! GPU memory allocation and buffer lifecycle.
//!
//! Buffers are move-only values: both the `vk::Buffer` handle and its memory
//! allocation are valid for the whole life of the value, and both are freed
//! together by exactly one [`DeviceAllocator::free_buffer`] call.

use crate::command::{self, CommandQueue};
use crate::context::RenderContext;
use crate::error::{RenderError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Wrapper around the device memory allocator.
pub struct DeviceAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl DeviceAllocator {
    /// Create a new allocator for the given device.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner_mut(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| RenderError::InvalidState("allocator already shut down".to_string()))
    }

    /// Allocate a buffer of `size` bytes.
    ///
    /// The buffer handle, the memory allocation, and the binding between them
    /// are three separately fallible device calls; a failure in a later step
    /// frees everything the earlier steps created.
    ///
    /// Errors: [`RenderError::AllocationFailed`].
    pub fn allocate_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        assert!(size > 0, "buffer size must be non-zero");

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|e| {
                    RenderError::AllocationFailed(format!("cannot create buffer {name:?}: {e}"))
                })?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner_mut()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(RenderError::AllocationFailed(format!(
                    "cannot allocate memory for {name:?}: {e}"
                )));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            if let Ok(inner) = self.inner_mut() {
                let _ = inner.free(allocation);
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(RenderError::AllocationFailed(format!(
                "cannot bind memory for {name:?}: {e}"
            )));
        }

        Ok(Buffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Grow a buffer to at least `new_size` bytes.
    ///
    /// If `buffer` already covers `new_size` it is returned unchanged with no
    /// allocation call. Otherwise a new buffer is allocated first and the old
    /// one is freed only after the new allocation succeeded, so a failed
    /// growth never destroys a buffer the caller still holds. Contents are
    /// not carried over; callers re-upload after growth.
    ///
    /// Errors: [`RenderError::AllocationFailed`].
    pub fn reallocate_buffer(
        &mut self,
        buffer: Buffer,
        new_size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        assert!(new_size > 0, "buffer size must be non-zero");

        if buffer.is_valid() && buffer.size >= new_size {
            return Ok(buffer);
        }

        let grown = self.allocate_buffer(new_size, usage, location, name)?;
        if buffer.is_valid() {
            self.free_buffer(buffer)?;
        }
        Ok(grown)
    }

    /// Free a buffer's allocation and handle together.
    ///
    /// Takes the buffer by value; the handle cannot be used afterwards.
    pub fn free_buffer(&mut self, buffer: Buffer) -> Result<()> {
        let Buffer {
            buffer: handle,
            allocation,
            ..
        } = buffer;

        if let Some(allocation) = allocation {
            self.inner_mut()?
                .free(allocation)
                .map_err(|e| RenderError::AllocationFailed(e.to_string()))?;
        }

        if handle != vk::Buffer::null() {
            unsafe {
                self.device.destroy_buffer(handle, None);
            }
        }

        Ok(())
    }

    /// Shut down the allocator, freeing all remaining GPU memory.
    ///
    /// Must happen before the Vulkan device is destroyed. Remaining
    /// allocations are freed and logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer and its backing memory allocation.
pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: u64,
}

impl Buffer {
    /// Whether both the handle and the allocation are live.
    pub fn is_valid(&self) -> bool {
        self.buffer != vk::Buffer::null() && self.allocation.is_some()
    }

    /// Map the buffer memory for CPU access.
    ///
    /// Host-visible allocations are persistently mapped; the returned borrow
    /// is the scoped view of that mapping. Fails with
    /// [`RenderError::MapFailed`] for device-local memory.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| RenderError::MapFailed("buffer memory is not host-visible".to_string()))
    }

    /// Get the device address of this buffer.
    ///
    /// The buffer must have been created with
    /// `vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }
}

/// Allocate a device buffer and fill it with `data` through a staging copy.
///
/// Allocates a host-visible staging buffer, copies `data` into it, allocates
/// the final buffer with `TRANSFER_DST` added to `usage`, records a one-shot
/// copy on `queue`, and blocks until the copy completes. The staging buffer
/// is freed on every path, and the final buffer is freed too if recording or
/// submission fails — the caller either gets a fully uploaded buffer or
/// nothing.
///
/// Errors: [`RenderError::AllocationFailed`], [`RenderError::MapFailed`],
/// [`RenderError::Submission`].
pub fn upload_buffer(
    ctx: &RenderContext,
    queue: &CommandQueue,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    data: &[u8],
    name: &str,
) -> Result<Buffer> {
    assert!(!data.is_empty(), "upload data must be non-empty");
    let size = data.len() as u64;

    let mut staging = ctx.allocator().lock().allocate_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "staging",
    )?;

    match staging.map() {
        Ok(mapped) => mapped[..data.len()].copy_from_slice(data),
        Err(e) => {
            ctx.allocator().lock().free_buffer(staging)?;
            return Err(e);
        }
    }

    let buffer = match ctx.allocator().lock().allocate_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        location,
        name,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            ctx.allocator().lock().free_buffer(staging)?;
            return Err(e);
        }
    };

    let cmd = match command::begin_one_time_submit(ctx.device(), queue.pool) {
        Ok(cmd) => cmd,
        Err(e) => {
            let mut allocator = ctx.allocator().lock();
            allocator.free_buffer(staging)?;
            allocator.free_buffer(buffer)?;
            return Err(e);
        }
    };

    let region = vk::BufferCopy::default().size(size);
    unsafe {
        ctx.device()
            .cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
    }

    if let Err(e) =
        command::end_one_time_submit(ctx.device(), cmd, queue.pool, queue.queue, queue.fence)
    {
        let mut allocator = ctx.allocator().lock();
        allocator.free_buffer(staging)?;
        allocator.free_buffer(buffer)?;
        return Err(e);
    }

    ctx.allocator().lock().free_buffer(staging)?;

    tracing::debug!(name, size, "uploaded buffer");
    Ok(buffer)
}
