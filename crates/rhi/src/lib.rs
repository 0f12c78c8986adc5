//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides the device-facing half of framepace on top of `ash`.
//! It handles:
//! - Instance, physical device and logical device creation
//! - The [`GpuDevice`] seam, with an ash-backed and a headless implementation
//! - Swapchain configuration and lifetime
//! - Command pools, command buffers and layout transitions
//! - Descriptor pools and layouts
//! - Synchronization primitives and generation-checked resource handles

mod error;

pub mod arena;
pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod headless;
pub mod instance;
pub mod physical_device;
pub mod swapchain;
pub mod sync;

pub use backend::{
    AttachmentDesc, AttachmentImage, GpuDevice, RenderTarget, SharedDevice, Submission,
    SwapchainDesc, SwapchainImages, TargetAttachment,
};
pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
