//! Scoped buffer cleanup.
//!
//! Multi-step GPU construction sequences need partially created buffers
//! freed on every early return, and scratch buffers freed on success and
//! failure alike. [`BufferGuard`] holds a buffer and frees it through the
//! context allocator when dropped; [`BufferGuard::into_inner`] disarms the
//! guard and hands the buffer back to the caller.

use crate::context::RenderContext;
use crate::memory::Buffer;
use std::ops::{Deref, DerefMut};

/// A buffer that is freed when the guard goes out of scope.
pub struct BufferGuard<'a> {
    ctx: &'a RenderContext,
    inner: Option<Buffer>,
}

impl<'a> BufferGuard<'a> {
    /// Guard `buffer`, freeing it on drop.
    pub fn new(ctx: &'a RenderContext, buffer: Buffer) -> Self {
        Self {
            ctx,
            inner: Some(buffer),
        }
    }

    /// Disarm the guard and take ownership of the buffer.
    pub fn into_inner(mut self) -> Buffer {
        self.inner.take().expect("guard is armed until consumed")
    }
}

impl Deref for BufferGuard<'_> {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.inner.as_ref().expect("guard is armed until consumed")
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.inner.as_mut().expect("guard is armed until consumed")
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.inner.take() {
            if let Err(e) = self.ctx.free_buffer(buffer) {
                tracing::warn!("failed to free guarded buffer: {e}");
            }
        }
    }
}
