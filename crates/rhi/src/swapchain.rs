//! Swapchain selection and lifetime.
//!
//! The selection helpers are pure functions over the surface capabilities;
//! [`resolve_swapchain`] combines them into a [`SwapchainDesc`], and
//! [`Swapchain`] owns the created object and its image views.
//!
//! # Example
//!
//! ```no_run
//! use framepace_rhi::swapchain::{Swapchain, SwapchainConfig, resolve_swapchain};
//! # fn demo(device: framepace_rhi::SharedDevice, surface: ash::vk::SurfaceKHR) -> framepace_rhi::RhiResult<()> {
//! let support = device.surface_support(surface)?;
//! let config = SwapchainConfig::new(1280, 720);
//! if let Some(desc) = resolve_swapchain(&support, surface, &config, None) {
//!     let swapchain = Swapchain::new(device.clone(), &desc)?;
//!     assert!(swapchain.image_count() >= desc.min_image_count);
//! }
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::{SharedDevice, SwapchainDesc, SwapchainImages};
use crate::error::{RhiError, RhiResult};

/// What a surface supports for swapchain creation.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Image count limits, extents, transforms and composite alpha modes
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported format and color space pairs
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Queries support details for a physical device and surface.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Surface support: {} formats, {} present modes, image count {}..{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            capabilities.max_image_count
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// At least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Caller preferences applied when resolving a swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// Drawable width in pixels, used when the surface leaves extent open
    pub width: u32,
    /// Drawable height in pixels
    pub height: u32,
    pub present_mode: vk::PresentModeKHR,
    pub preferred_image_count: Option<u32>,
}

impl SwapchainConfig {
    /// MAILBOX preference with the default image count.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            present_mode: vk::PresentModeKHR::MAILBOX,
            preferred_image_count: None,
        }
    }
}

/// Resolves a creation description for the surface.
///
/// Returns `None` when the drawable area is zero in either dimension
/// (minimized window); no swapchain can be created until it grows.
pub fn resolve_swapchain(
    support: &SurfaceSupport,
    surface: vk::SurfaceKHR,
    config: &SwapchainConfig,
    old_swapchain: Option<&Swapchain>,
) -> Option<SwapchainDesc> {
    if !support.is_adequate() {
        warn!("Surface reports no formats or present modes");
        return None;
    }

    let extent = choose_extent(&support.capabilities, config.width, config.height);
    if extent.width == 0 || extent.height == 0 {
        debug!("Surface extent is zero, deferring swapchain creation");
        return None;
    }

    Some(SwapchainDesc {
        surface,
        min_image_count: determine_image_count(
            &support.capabilities,
            config.preferred_image_count,
        ),
        format: choose_surface_format(&support.formats),
        extent,
        present_mode: choose_present_mode(&support.present_modes, config.present_mode),
        composite_alpha: choose_composite_alpha(support.capabilities.supported_composite_alpha),
        pre_transform: choose_pre_transform(&support.capabilities),
        old_swapchain: old_swapchain.map_or(vk::SwapchainKHR::null(), Swapchain::handle),
    })
}

/// A created swapchain and its image views.
///
/// Not thread-safe; owned by the submission thread.
pub struct Swapchain {
    device: SharedDevice,
    images: SwapchainImages,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Creates the swapchain described by `desc`.
    ///
    /// When `desc.old_swapchain` is set, the old swapchain is retired but not
    /// destroyed; drop it after this call returns.
    pub fn new(device: SharedDevice, desc: &SwapchainDesc) -> RhiResult<Self> {
        let images = device.create_swapchain(desc)?;
        if images.images.is_empty() || images.images.len() != images.views.len() {
            return Err(RhiError::SwapchainError(format!(
                "swapchain returned {} images and {} views",
                images.images.len(),
                images.views.len()
            )));
        }

        info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} images",
            desc.extent.width,
            desc.extent.height,
            desc.format.format,
            desc.present_mode,
            images.images.len()
        );

        Ok(Self {
            device,
            images,
            format: desc.format.format,
            extent: desc.extent,
            present_mode: desc.present_mode,
        })
    }

    /// Acquires the next image, signalling `semaphore` when it is available.
    #[inline]
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        self.device
            .acquire_next_image(self.images.swapchain, semaphore)
    }

    /// Presents `image_index` after `wait_semaphore` signals.
    ///
    /// Returns true when the swapchain is suboptimal.
    #[inline]
    pub fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool, vk::Result> {
        self.device
            .queue_present(self.images.swapchain, image_index, wait_semaphore)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.images.swapchain
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.images.len() as u32
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images.images
    }

    #[inline]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.images.views
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.device.destroy_swapchain(&self.images);
        debug!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.images.len()
        );
    }
}

/// Prefers B8G8R8A8_SRGB, then B8G8R8A8_UNORM, then whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let with_format = |format: vk::Format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };

    if let Some(format) = with_format(vk::Format::B8G8R8A8_SRGB) {
        return format;
    }
    if let Some(format) = with_format(vk::Format::B8G8R8A8_UNORM) {
        warn!("Using fallback surface format B8G8R8A8_UNORM");
        return format;
    }

    let first = formats.first().copied().unwrap_or_default();
    warn!("Using first available surface format {:?}", first.format);
    first
}

/// Uses `preferred` when supported, otherwise FIFO which is always available.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        return preferred;
    }
    debug!("Present mode {:?} unsupported, using FIFO", preferred);
    vk::PresentModeKHR::FIFO
}

/// The surface's current extent, or the requested size clamped to its
/// limits when the surface leaves the extent to the swapchain.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum unless a count is requested, clamped to the
/// surface limits. A maximum of zero means unbounded.
pub fn determine_image_count(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    preferred: Option<u32>,
) -> u32 {
    let requested = preferred
        .unwrap_or(capabilities.min_image_count + 1)
        .max(capabilities.min_image_count);

    if capabilities.max_image_count > 0 {
        requested.min(capabilities.max_image_count)
    } else {
        requested
    }
}

/// Composite alpha tried in order: opaque, pre-multiplied, post-multiplied,
/// inherit.
pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    const PREFERENCE: [vk::CompositeAlphaFlagsKHR; 4] = [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ];

    PREFERENCE
        .into_iter()
        .find(|&mode| supported.contains(mode))
        .unwrap_or_else(|| {
            warn!("Surface reports no composite alpha mode, assuming OPAQUE");
            vk::CompositeAlphaFlagsKHR::OPAQUE
        })
}

/// Identity first, then the rotations, then the surface's current transform.
pub fn choose_pre_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::SurfaceTransformFlagsKHR {
    const PREFERENCE: [vk::SurfaceTransformFlagsKHR; 4] = [
        vk::SurfaceTransformFlagsKHR::IDENTITY,
        vk::SurfaceTransformFlagsKHR::ROTATE_90,
        vk::SurfaceTransformFlagsKHR::ROTATE_180,
        vk::SurfaceTransformFlagsKHR::ROTATE_270,
    ];

    PREFERENCE
        .into_iter()
        .find(|&transform| capabilities.supported_transforms.contains(transform))
        .unwrap_or(capabilities.current_transform)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn capabilities(width: u32, height: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D { width, height },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    #[test]
    fn test_choose_surface_format_prefers_srgb() {
        let formats = [
            srgb(vk::Format::R8G8B8A8_UNORM),
            srgb(vk::Format::B8G8R8A8_UNORM),
            srgb(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn test_choose_surface_format_fallbacks() {
        let formats = [srgb(vk::Format::R8G8B8A8_UNORM), srgb(vk::Format::B8G8R8A8_UNORM)];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::B8G8R8A8_UNORM
        );

        let formats = [srgb(vk::Format::R8G8B8A8_UNORM)];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn test_choose_present_mode_honours_preference() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn test_choose_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let extent = choose_extent(&capabilities(1920, 1080), 800, 600);
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn test_choose_extent_clamps_when_open() {
        let caps = capabilities(u32::MAX, u32::MAX);
        let extent = choose_extent(&caps, 9000, 0);
        assert_eq!((extent.width, extent.height), (4096, 1));
        let extent = choose_extent(&caps, 800, 600);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_determine_image_count() {
        let caps = capabilities(800, 600);
        assert_eq!(determine_image_count(&caps, None), 3);
        assert_eq!(determine_image_count(&caps, Some(8)), 3);
        assert_eq!(determine_image_count(&caps, Some(1)), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unbounded, Some(6)), 6);
    }

    #[test]
    fn test_composite_alpha_preference_order() {
        assert_eq!(
            choose_composite_alpha(
                vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::OPAQUE
            ),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        assert_eq!(
            choose_composite_alpha(
                vk::CompositeAlphaFlagsKHR::INHERIT
                    | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
            ),
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
        );
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn test_pre_transform_prefers_identity() {
        let mut caps = capabilities(800, 600);
        caps.supported_transforms =
            vk::SurfaceTransformFlagsKHR::ROTATE_90 | vk::SurfaceTransformFlagsKHR::IDENTITY;
        assert_eq!(
            choose_pre_transform(&caps),
            vk::SurfaceTransformFlagsKHR::IDENTITY
        );

        caps.supported_transforms = vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR;
        caps.current_transform = vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR;
        assert_eq!(
            choose_pre_transform(&caps),
            vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR
        );
    }

    #[test]
    fn test_resolve_defers_zero_extent() {
        let support = SurfaceSupport {
            capabilities: capabilities(0, 0),
            formats: vec![srgb(vk::Format::B8G8R8A8_SRGB)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let config = SwapchainConfig::new(0, 0);
        assert!(resolve_swapchain(&support, vk::SurfaceKHR::null(), &config, None).is_none());
    }

    #[test]
    fn test_resolve_combines_choices() {
        let support = SurfaceSupport {
            capabilities: capabilities(640, 480),
            formats: vec![srgb(vk::Format::B8G8R8A8_SRGB)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let desc = resolve_swapchain(
            &support,
            vk::SurfaceKHR::null(),
            &SwapchainConfig::new(640, 480),
            None,
        )
        .unwrap();
        assert_eq!(desc.extent, vk::Extent2D { width: 640, height: 480 });
        assert_eq!(desc.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(desc.min_image_count, 3);
        assert_eq!(desc.old_swapchain, vk::SwapchainKHR::null());
    }

    #[test]
    fn test_surface_support_is_adequate() {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(!support.is_adequate());
    }
}
