//! The render context: one surface, its frame pacing and everything that
//! records into it.
//!
//! [`RenderContext`] owns the registries a frame needs (per-thread command
//! pools, descriptor pools, the render-pass graph) and the
//! [`FrameScheduler`]. Nothing is process-global, so several contexts,
//! including headless ones, can coexist.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framepace_core::RenderConfig;
//! use framepace_renderer::RenderContext;
//! use framepace_rhi::headless::HeadlessDevice;
//! use framepace_rhi::{AttachmentDesc, vk};
//!
//! let device = Arc::new(HeadlessDevice::new());
//! let surface = device.create_surface();
//! let mut context =
//!     RenderContext::new(device, surface, 800, 600, &RenderConfig::default()).unwrap();
//!
//! let present = context.declare_render_pass(
//!     "present",
//!     vec![AttachmentDesc::color("backbuffer", vk::Format::B8G8R8A8_SRGB, [0.1, 0.1, 0.1, 1.0])],
//!     true,
//! );
//! context.set_draw_callback(present, |pass| {
//!     pass.command_buffer.set_viewport_scissor(pass.extent);
//! });
//!
//! if let Some(frame) = context.acquire_frame() {
//!     context.record(&frame);
//!     context.submit_frame(frame);
//! }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use framepace_core::RenderConfig;
use framepace_rhi::descriptor::DescriptorSetLayout;
use framepace_rhi::{AttachmentDesc, RhiResult, SharedDevice};

use crate::command_pools::CommandPools;
use crate::descriptor_allocator::{DescriptorAllocator, DescriptorHandle};
use crate::frame_scheduler::{FrameHandle, FrameScheduler, SurfaceRecreated};
use crate::per_frame::FrameCounts;
use crate::render_graph::{PassId, PassRecorder, RenderGraph};

/// Called after every surface rebuild.
pub type SurfaceListener = Box<dyn FnMut(&SurfaceRecreated) + Send>;

/// Frame pacing and GPU resource lifetime for one surface.
pub struct RenderContext {
    // Fields drop in declaration order: attachments before the swapchain,
    // frame command buffers before their pools.
    graph: RenderGraph,
    scheduler: FrameScheduler,
    descriptors: Arc<DescriptorAllocator>,
    command_pools: CommandPools,
    listeners: Vec<SurfaceListener>,
    counts: Arc<FrameCounts>,
    config: RenderConfig,
    device: SharedDevice,
}

impl RenderContext {
    /// Builds the context and its first swapchain.
    ///
    /// The calling thread becomes the submission thread. An invalid
    /// `config` is fatal.
    ///
    /// # Errors
    ///
    /// Fails if a command pool, synchronization object or the swapchain
    /// cannot be created.
    ///
    /// # Arguments
    ///
    /// * `device` - Device every object of this context is created on
    /// * `surface` - Surface the swapchain presents to
    /// * `width`, `height` - Initial drawable size in pixels
    /// * `config` - Pacing and descriptor pool settings
    pub fn new(
        device: SharedDevice,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        config: &RenderConfig,
    ) -> RhiResult<Self> {
        if let Err(e) = config.validate() {
            fatal!("Invalid render configuration: {}", e);
        }

        let counts = FrameCounts::new(config.frames_in_flight, 0);
        let command_pools = CommandPools::new(device.clone());
        let descriptors = Arc::new(DescriptorAllocator::new(
            device.clone(),
            &config.descriptor_pool,
        ));
        let scheduler = FrameScheduler::new(
            device.clone(),
            Arc::clone(&counts),
            command_pools.get()?,
            surface,
            width,
            height,
            config,
        )?;
        let graph = RenderGraph::new(device.clone(), Arc::clone(&counts));

        let mut context = Self {
            graph,
            scheduler,
            descriptors,
            command_pools,
            listeners: Vec::new(),
            counts,
            config: config.clone(),
            device,
        };
        context.dispatch_surface_recreated();

        info!(
            "Render context created on '{}': {} frame(s) in flight, {} image(s)",
            context.device.name(),
            context.counts.frames_in_flight(),
            context.counts.image_count()
        );
        Ok(context)
    }

    // ========================================================================== //
    // Frame loop
    // ========================================================================== //

    /// Starts a frame. `None` means skip this tick.
    pub fn acquire_frame(&mut self) -> Option<FrameHandle> {
        let frame = self.scheduler.acquire_frame();
        self.dispatch_surface_recreated();
        frame
    }

    /// Records the render graph into `frame`.
    pub fn record(&mut self, frame: &FrameHandle) {
        self.graph.generate(frame);
    }

    /// Submits and presents `frame`. Terminal for the frame.
    pub fn submit_frame(&mut self, frame: FrameHandle) {
        self.scheduler.submit_frame(frame);
        self.dispatch_surface_recreated();
    }

    /// Acquires, records and submits one frame. Returns whether a frame was
    /// presented.
    pub fn draw_frame(&mut self) -> bool {
        let Some(frame) = self.acquire_frame() else {
            return false;
        };
        self.record(&frame);
        self.submit_frame(frame);
        true
    }

    /// New drawable size; the swapchain follows on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.scheduler.resize(width, height);
    }

    fn dispatch_surface_recreated(&mut self) {
        let Some(event) = self.scheduler.take_surface_recreated() else {
            return;
        };
        self.graph.on_surface_recreated(&event);
        for listener in &mut self.listeners {
            listener(&event);
        }
        debug!(
            "Surface generation {} dispatched to {} listener(s)",
            event.generation,
            self.listeners.len()
        );
    }

    /// Subscribes to surface rebuilds.
    pub fn on_surface_recreated(
        &mut self,
        listener: impl FnMut(&SurfaceRecreated) + Send + 'static,
    ) {
        self.listeners.push(Box::new(listener));
    }

    // ========================================================================== //
    // Render passes
    // ========================================================================== //

    /// Declares a render pass. Duplicate names are fatal.
    pub fn declare_render_pass(
        &mut self,
        name: &str,
        attachments: Vec<AttachmentDesc>,
        is_present: bool,
    ) -> PassId {
        self.graph.declare(name, attachments, is_present)
    }

    /// Looks up a declared pass by name.
    pub fn find_render_pass(&self, name: &str) -> Option<PassId> {
        self.graph.find(name)
    }

    /// Makes `child` render before `parent`, its outputs readable by it.
    pub fn add_child(&mut self, parent: PassId, child: PassId) {
        self.graph.add_child(parent, child);
    }

    /// Sets the commands recorded inside `pass` every frame, replacing any
    /// earlier callback.
    pub fn set_draw_callback(
        &mut self,
        pass: PassId,
        callback: impl FnMut(&PassRecorder<'_>) + Send + 'static,
    ) {
        self.graph.set_draw_callback(pass, callback);
    }

    // ========================================================================== //
    // Descriptors
    // ========================================================================== //

    /// Allocates a descriptor set of `layout`. Failure is fatal.
    pub fn allocate_descriptor(&self, layout: &DescriptorSetLayout) -> DescriptorHandle {
        match self.descriptors.allocate(layout) {
            Ok(handle) => handle,
            Err(e) => fatal!("Descriptor allocation failed: {}", e),
        }
    }

    /// Releases `handle` once no frame in flight can still bind it.
    ///
    /// A set allocated on another thread is handed back to that thread,
    /// which frees it on its next allocation or
    /// [`DescriptorAllocator::release_pending_frees`].
    pub fn free_descriptor(&mut self, handle: DescriptorHandle) {
        let descriptors = Arc::clone(&self.descriptors);
        self.scheduler
            .defer_until_retired(move || descriptors.free(handle));
    }

    // ========================================================================== //
    // Lifetime
    // ========================================================================== //

    /// Waits for every frame in flight and for the device to go idle.
    ///
    /// # Errors
    ///
    /// Fails if the device is lost.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.scheduler.wait_for_all_frames();
        self.device.wait_idle()
    }

    // ========================================================================== //
    // Accessors
    // ========================================================================== //

    #[inline]
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    #[inline]
    pub fn counts(&self) -> &Arc<FrameCounts> {
        &self.counts
    }

    #[inline]
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    #[inline]
    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    #[inline]
    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    #[inline]
    pub fn command_pools(&self) -> &CommandPools {
        &self.command_pools
    }

    /// Shared with worker threads that allocate their own sets.
    #[inline]
    pub fn descriptors(&self) -> &Arc<DescriptorAllocator> {
        &self.descriptors
    }

    /// Extent of the current swapchain.
    pub fn extent(&self) -> vk::Extent2D {
        self.scheduler.extent()
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to wait for device idle during context drop: {}", e);
        }
        self.graph.destroy();
        info!("Render context destroyed");
    }
}
