//! Command pool and command buffer wrappers.
//!
//! - [`CommandPool`] owns a VkCommandPool and allocates primary buffers
//! - [`CommandBuffer`] is a non-owning recording handle
//!
//! # Example
//!
//! ```no_run
//! use framepace_rhi::command::CommandPool;
//!
//! # fn example(device: framepace_rhi::SharedDevice) -> framepace_rhi::RhiResult<()> {
//! let pool = CommandPool::new(device.clone(), device.graphics_queue_family())?;
//! let cmd = pool.allocate_command_buffer()?;
//!
//! cmd.begin()?;
//! // ... record ...
//! cmd.end()?;
//! pool.free_command_buffer(&cmd);
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::debug;

use crate::backend::{RenderTarget, SharedDevice};
use crate::error::RhiResult;

/// RAII command pool.
///
/// Vulkan pools are externally synchronized: a pool and the buffers it
/// allocated must only be recorded from one thread at a time.
pub struct CommandPool {
    device: SharedDevice,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a pool whose buffers can be reset individually.
    pub fn new(device: SharedDevice, queue_family_index: u32) -> RhiResult<Self> {
        Self::with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    /// Creates a pool hinted for short-lived, one-shot buffers.
    pub fn new_transient(device: SharedDevice, queue_family_index: u32) -> RhiResult<Self> {
        Self::with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                | vk::CommandPoolCreateFlags::TRANSIENT,
        )
    }

    fn with_flags(
        device: SharedDevice,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<Self> {
        let pool = device.create_command_pool(queue_family_index, flags)?;
        debug!(
            "Command pool created for queue family {} ({:?})",
            queue_family_index, flags
        );
        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates one primary command buffer.
    pub fn allocate_command_buffer(&self) -> RhiResult<CommandBuffer> {
        let mut buffers = self.allocate_command_buffers(1)?;
        Ok(buffers.remove(0))
    }

    /// Allocates `count` primary command buffers.
    pub fn allocate_command_buffers(&self, count: u32) -> RhiResult<Vec<CommandBuffer>> {
        let handles = self.device.allocate_command_buffers(self.pool, count)?;
        Ok(handles
            .into_iter()
            .map(|buffer| CommandBuffer::from_handle(self.device.clone(), buffer))
            .collect())
    }

    /// Returns a buffer to the pool. The buffer must not be pending.
    pub fn free_command_buffer(&self, buffer: &CommandBuffer) {
        self.device
            .free_command_buffers(self.pool, &[buffer.handle()]);
    }

    /// Returns several buffers to the pool.
    pub fn free_command_buffers(&self, buffers: &[CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        let handles: Vec<vk::CommandBuffer> = buffers.iter().map(CommandBuffer::handle).collect();
        self.device.free_command_buffers(self.pool, &handles);
    }

    /// Resets every buffer allocated from this pool.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_pool(self.pool)
    }

    #[inline]
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Recording handle for a primary command buffer.
///
/// Does not own the buffer; its pool frees it.
#[derive(Clone)]
pub struct CommandBuffer {
    device: SharedDevice,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    #[inline]
    pub fn from_handle(device: SharedDevice, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    #[inline]
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    // ========================================================================== //
    // Recording control
    // ========================================================================== //

    /// Begins recording for a single submission.
    pub fn begin(&self) -> RhiResult<()> {
        self.device
            .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_buffer(self.buffer)
    }

    // ========================================================================== //
    // Debug labels
    // ========================================================================== //

    pub fn begin_label(&self, label: &str) {
        self.device.cmd_begin_label(self.buffer, label);
    }

    pub fn end_label(&self) {
        self.device.cmd_end_label(self.buffer);
    }

    // ========================================================================== //
    // Dynamic rendering
    // ========================================================================== //

    pub fn begin_rendering(&self, target: &RenderTarget<'_>) {
        self.device.cmd_begin_rendering(self.buffer, target);
    }

    pub fn end_rendering(&self) {
        self.device.cmd_end_rendering(self.buffer);
    }

    /// Sets a full-extent viewport and scissor.
    pub fn set_viewport_scissor(&self, extent: vk::Extent2D) {
        self.device.cmd_set_viewport_scissor(self.buffer, extent);
    }

    // ========================================================================== //
    // Barriers
    // ========================================================================== //

    /// Records a layout transition for a single-mip, single-layer image.
    pub fn transition_image(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.device
            .cmd_transition_image(self.buffer, image, aspect, old_layout, new_layout);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Stage and access masks for a layout transition.
///
/// Unknown pairs fall back to a full pipeline barrier.
pub fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (
    vk::PipelineStageFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::AccessFlags,
) {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};

    match (old_layout, new_layout) {
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            S::TOP_OF_PIPE,
            A::empty(),
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            S::TOP_OF_PIPE,
            A::empty(),
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
            S::BOTTOM_OF_PIPE,
            A::empty(),
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            A::SHADER_READ,
        ),
        (L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            A::SHADER_READ,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            S::FRAGMENT_SHADER,
            A::SHADER_READ,
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            S::FRAGMENT_SHADER,
            A::SHADER_READ,
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        _ => {
            tracing::warn!(
                "No tailored barrier for {:?} -> {:?}, using ALL_COMMANDS",
                old_layout,
                new_layout
            );
            (
                S::ALL_COMMANDS,
                A::MEMORY_WRITE,
                S::ALL_COMMANDS,
                A::MEMORY_READ | A::MEMORY_WRITE,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::headless::{DeviceEvent, HeadlessDevice};

    #[test]
    fn test_allocate_and_free() {
        let headless = Arc::new(HeadlessDevice::new());
        let device: SharedDevice = headless.clone();
        let pool = CommandPool::new(device.clone(), device.graphics_queue_family()).unwrap();

        let buffers = pool.allocate_command_buffers(3).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(headless.live_command_buffers(), 3);

        pool.free_command_buffers(&buffers);
        assert_eq!(headless.live_command_buffers(), 0);
    }

    #[test]
    fn test_begin_is_logged() {
        let headless = Arc::new(HeadlessDevice::new());
        let device: SharedDevice = headless.clone();
        let pool = CommandPool::new_transient(device, 0).unwrap();
        let cmd = pool.allocate_command_buffer().unwrap();

        cmd.begin().unwrap();
        cmd.begin_label("upload");
        cmd.end_label();
        cmd.end().unwrap();

        let events = headless.events();
        assert!(events.contains(&DeviceEvent::CommandBufferBegun(cmd.handle())));
        assert!(events.contains(&DeviceEvent::LabelBegun("upload".to_string())));
    }

    #[test]
    fn test_pool_destroyed_on_drop() {
        let headless = Arc::new(HeadlessDevice::new());
        {
            let _pool = CommandPool::new(headless.clone(), 0).unwrap();
            assert_eq!(headless.live_objects(), 1);
        }
        assert_eq!(headless.live_objects(), 0);
    }

    #[test]
    fn test_transition_masks() {
        let (src_stage, _, dst_stage, dst_access) = transition_masks(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(dst_access, vk::AccessFlags::SHADER_READ);

        let (_, _, dst_stage, _) = transition_masks(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert_eq!(dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }

    #[test]
    fn test_command_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CommandPool>();
        assert_send_sync::<CommandBuffer>();
    }
}
