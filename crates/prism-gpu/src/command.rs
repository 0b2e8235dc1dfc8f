//! One-shot command submission and the shared command-queue pool.
//!
//! All GPU-side work in this layer (buffer uploads, acceleration-structure
//! builds) goes through a single-use command buffer that is submitted and
//! waited on before the calling function returns. Submission is serialized
//! behind the fence wait rather than pipelined; staging resources can never
//! be freed while still in flight.

use crate::error::{RenderError, Result};
use ash::vk;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Allocate a primary command buffer from `pool` and begin recording it for
/// a single submission.
///
/// Errors: [`RenderError::Submission`].
pub fn begin_one_time_submit(device: &ash::Device, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let cmd = unsafe {
        device.allocate_command_buffers(&alloc_info).map_err(|e| {
            RenderError::Submission(format!("cannot allocate command buffer: {e}"))
        })?[0]
    };

    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    if let Err(e) = unsafe { device.begin_command_buffer(cmd, &begin_info) } {
        unsafe { device.free_command_buffers(pool, &[cmd]) };
        return Err(RenderError::Submission(format!(
            "cannot begin command buffer: {e}"
        )));
    }

    Ok(cmd)
}

/// End, submit, and wait for a one-shot command buffer, then free it.
///
/// Blocks until `fence` signals with an effectively unbounded timeout; use
/// [`end_one_time_submit_with_timeout`] to bound the wait. The command buffer
/// is freed back to `pool` on every path, success or failure.
///
/// Errors: [`RenderError::Submission`].
pub fn end_one_time_submit(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    pool: vk::CommandPool,
    queue: vk::Queue,
    fence: vk::Fence,
) -> Result<()> {
    end_one_time_submit_with_timeout(device, cmd, pool, queue, fence, u64::MAX)
}

/// [`end_one_time_submit`] with an explicit fence-wait timeout in
/// nanoseconds.
pub fn end_one_time_submit_with_timeout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    pool: vk::CommandPool,
    queue: vk::Queue,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    let free_cmd = || unsafe { device.free_command_buffers(pool, &[cmd]) };

    if let Err(e) = unsafe { device.end_command_buffer(cmd) } {
        free_cmd();
        return Err(RenderError::Submission(format!(
            "cannot end command buffer: {e}"
        )));
    }

    let cmd_buffers = [cmd];
    let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);

    if let Err(e) = unsafe { device.queue_submit(queue, &[submit_info], fence) } {
        free_cmd();
        return Err(RenderError::Submission(format!(
            "cannot submit command buffer: {e}"
        )));
    }

    if let Err(e) = unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        free_cmd();
        return Err(RenderError::Submission(format!(
            "cannot wait on one-shot submit fence: {e}"
        )));
    }

    if let Err(e) = unsafe { device.reset_fences(&[fence]) } {
        free_cmd();
        return Err(RenderError::Submission(format!(
            "cannot reset one-shot submit fence: {e}"
        )));
    }

    free_cmd();
    Ok(())
}

/// A GPU execution queue with its command pool and one-shot submit fence.
///
/// Exactly one holder records and submits against a given queue at a time;
/// the pool hands a queue out on acquire and takes it back on release.
#[derive(Debug)]
pub struct CommandQueue {
    pub id: u32,
    pub family: u32,
    pub queue: vk::Queue,
    pub pool: vk::CommandPool,
    pub fence: vk::Fence,
}

/// Bounded pool of [`CommandQueue`]s shared by concurrent callers.
pub struct CommandQueuePool {
    free: Mutex<Vec<CommandQueue>>,
    available: Condvar,
    capacity: usize,
}

impl CommandQueuePool {
    /// Create one command pool and fence per queue.
    ///
    /// Partially created pools and fences are destroyed again if a later
    /// creation fails.
    ///
    /// # Safety
    /// The device must be valid and the queues must belong to `family`.
    pub unsafe fn new(
        device: &ash::Device,
        family: u32,
        queues: &[vk::Queue],
    ) -> Result<Self> {
        assert!(!queues.is_empty(), "command queue pool cannot be empty");

        let mut free = Vec::with_capacity(queues.len());

        for (id, &queue) in queues.iter().enumerate() {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);

            let pool = match unsafe { device.create_command_pool(&pool_info, None) } {
                Ok(pool) => pool,
                Err(e) => {
                    unsafe { Self::destroy_entries(device, &mut free) };
                    return Err(RenderError::ObjectCreation(format!(
                        "cannot create command pool: {e}"
                    )));
                }
            };

            let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            {
                Ok(fence) => fence,
                Err(e) => {
                    unsafe {
                        device.destroy_command_pool(pool, None);
                        Self::destroy_entries(device, &mut free);
                    }
                    return Err(RenderError::ObjectCreation(format!(
                        "cannot create submit fence: {e}"
                    )));
                }
            };

            free.push(CommandQueue {
                id: id as u32,
                family,
                queue,
                pool,
                fence,
            });
        }

        let capacity = free.len();
        Ok(Self {
            free: Mutex::new(free),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Take a queue out of the pool, blocking until one is free.
    ///
    /// `None` waits forever. Errors: [`RenderError::Timeout`].
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<CommandQueue> {
        let mut free = self.free.lock();

        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while free.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    return Err(RenderError::Timeout(
                        "no command queue became free".to_string(),
                    ));
                }
                self.available.wait_for(&mut free, deadline - now);
            }
        } else {
            while free.is_empty() {
                self.available.wait(&mut free);
            }
        }

        Ok(free.pop().expect("pool is non-empty"))
    }

    /// Return a queue to the pool and wake one waiter.
    ///
    /// `None` waits forever for the pool lock. Errors:
    /// [`RenderError::Timeout`].
    pub fn release(&self, queue: CommandQueue, timeout: Option<Duration>) -> Result<()> {
        let mut free = match timeout {
            Some(timeout) => self.free.try_lock_for(timeout).ok_or_else(|| {
                RenderError::Timeout("cannot lock command queue pool".to_string())
            })?,
            None => self.free.lock(),
        };

        free.push(queue);
        self.available.notify_one();
        Ok(())
    }

    /// Number of queues currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Destroy all pools and fences.
    ///
    /// # Safety
    /// The device must be valid, every queue must have been released, and no
    /// submission may still be in flight.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        let mut free = self.free.lock();
        assert_eq!(
            free.len(),
            self.capacity,
            "all command queues must be released before destroying the pool"
        );
        unsafe { Self::destroy_entries(device, &mut free) };
    }

    unsafe fn destroy_entries(device: &ash::Device, entries: &mut Vec<CommandQueue>) {
        for entry in entries.drain(..) {
            unsafe {
                device.destroy_fence(entry.fence, None);
                device.destroy_command_pool(entry.pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_queue(id: u32) -> CommandQueue {
        CommandQueue {
            id,
            family: 0,
            queue: vk::Queue::null(),
            pool: vk::CommandPool::null(),
            fence: vk::Fence::null(),
        }
    }

    fn pool_of(count: u32) -> CommandQueuePool {
        CommandQueuePool {
            free: Mutex::new((0..count).map(null_queue).collect()),
            available: Condvar::new(),
            capacity: count as usize,
        }
    }

    #[test]
    fn acquire_drains_pool() {
        let pool = pool_of(2);
        let a = pool.acquire(Some(Duration::from_millis(10))).unwrap();
        let b = pool.acquire(Some(Duration::from_millis(10))).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn acquire_times_out_when_empty() {
        let pool = pool_of(1);
        let held = pool.acquire(Some(Duration::from_millis(10))).unwrap();

        let err = pool.acquire(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, RenderError::Timeout(_)));

        pool.release(held, None).unwrap();
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn release_wakes_waiter() {
        let pool = std::sync::Arc::new(pool_of(1));
        let held = pool.acquire(None).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire(Some(Duration::from_secs(5))).map(|q| q.id))
        };

        std::thread::sleep(Duration::from_millis(20));
        pool.release(held, Some(Duration::from_millis(100))).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }
}
