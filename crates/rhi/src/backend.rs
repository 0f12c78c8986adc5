//! The device seam between the frame-pacing core and the driver.
//!
//! Everything above this module talks to the GPU through [`GpuDevice`]. The
//! Vulkan [`Device`](crate::device::Device) implements it on top of `ash`;
//! [`HeadlessDevice`](crate::headless::HeadlessDevice) implements it in
//! process so pacing behaviour can be exercised without a GPU.
//!
//! Handles are plain `ash::vk` handles. Objects created through one device
//! must only be passed back to that same device.

use std::sync::Arc;

use ash::vk;

use crate::error::RhiResult;
use crate::swapchain::SurfaceSupport;

/// Shared, type-erased device reference held by every RAII wrapper.
pub type SharedDevice = Arc<dyn GpuDevice>;

/// A queue submission.
///
/// `wait_stages` is parallel to `wait_semaphores`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// Parameters for creating a swapchain, already resolved against the
/// surface capabilities.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// A created swapchain with its presentable images and their views.
#[derive(Clone, Debug, Default)]
pub struct SwapchainImages {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

/// Description of an offscreen attachment a render pass writes.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentDesc {
    pub name: String,
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

impl AttachmentDesc {
    /// A color attachment cleared to `clear_color` and stored.
    pub fn color(name: impl Into<String>, format: vk::Format, clear_color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_color,
            clear_depth: 1.0,
        }
    }

    /// A depth attachment cleared to 1.0 whose contents are discarded.
    pub fn depth(name: impl Into<String>, format: vk::Format) -> Self {
        Self {
            name: name.into(),
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
        }
    }

    /// Whether the format carries depth (and possibly stencil).
    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }

    /// Image aspect matching the format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }
}

/// Returns true for the depth and depth-stencil formats.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Image aspect flags for a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        f if is_depth_format(f) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A device-local image created for an [`AttachmentDesc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// One attachment bound for dynamic rendering.
#[derive(Clone, Copy, Debug)]
pub struct TargetAttachment {
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

/// Attachments and render area for one dynamic rendering scope.
#[derive(Clone, Copy, Debug)]
pub struct RenderTarget<'a> {
    pub extent: vk::Extent2D,
    pub attachments: &'a [TargetAttachment],
}

/// Narrow device interface used by the frame-pacing core.
///
/// Destroy calls take handles by value and must not be given handles that
/// are still referenced by pending GPU work.
pub trait GpuDevice: Send + Sync + 'static {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Queue family used for graphics submission and one-shot work.
    fn graphics_queue_family(&self) -> u32;

    // ========================================================================== //
    // Synchronization
    // ========================================================================== //

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // ========================================================================== //
    // Command pools and buffers
    // ========================================================================== //

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    // ========================================================================== //
    // Queue
    // ========================================================================== //

    /// Submit to the graphics queue. Implementations serialize access to the
    /// queue so several surfaces may share it.
    fn queue_submit(&self, submission: &Submission<'_>) -> RhiResult<()>;

    /// Present `image_index` once `wait_semaphore` signals.
    ///
    /// `Ok(true)` means presented but suboptimal. Stale surfaces surface as
    /// `Err(vk::Result::ERROR_OUT_OF_DATE_KHR)`.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result>;

    fn wait_idle(&self) -> RhiResult<()>;

    // ========================================================================== //
    // Descriptors
    // ========================================================================== //

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;
    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> RhiResult<()>;

    // ========================================================================== //
    // Surface and swapchain
    // ========================================================================== //

    fn surface_support(&self, surface: vk::SurfaceKHR) -> RhiResult<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<SwapchainImages>;
    fn destroy_swapchain(&self, images: &SwapchainImages);

    /// Acquire the next presentable image, signalling `semaphore`.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result>;

    // ========================================================================== //
    // Attachments
    // ========================================================================== //

    fn create_attachment(
        &self,
        desc: &AttachmentDesc,
        extent: vk::Extent2D,
    ) -> RhiResult<AttachmentImage>;
    fn destroy_attachment(&self, attachment: &AttachmentImage);

    // ========================================================================== //
    // Recording
    // ========================================================================== //

    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, label: &str);
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer);
    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, target: &RenderTarget<'_>);
    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer);
    fn cmd_set_viewport_scissor(&self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_transition_image(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats_use_depth_aspect() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_color_formats_use_color_aspect() {
        assert!(!is_depth_format(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(
            aspect_for_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_attachment_desc_constructors() {
        let color = AttachmentDesc::color("hdr", vk::Format::R16G16B16A16_SFLOAT, [0.0; 4]);
        assert!(!color.is_depth());
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);

        let depth = AttachmentDesc::depth("depth", vk::Format::D32_SFLOAT);
        assert!(depth.is_depth());
        assert_eq!(depth.aspect(), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn test_device_is_object_safe() {
        fn assert_object_safe(_: Option<&dyn GpuDevice>) {}
        assert_object_safe(None);
    }
}
