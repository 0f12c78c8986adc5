//! Acquire, submit and present for one surface.
//!
//! The [`FrameScheduler`] owns the swapchain, one [`SlotSync`] per frame in
//! flight and one command buffer per presentable image. It drives the
//! per-frame state machine:
//!
//! ```text
//! 1. wait on the fence of in-flight slot `current_frame`
//! 2. skip when the drawable area is zero
//! 3. acquire an image, signalling the slot's image_acquired semaphore
//!    (out-of-date: rebuild and skip; other failures: drop the frame)
//! 4. if the image was last used by another slot whose fence has not been
//!    observed, wait on that fence too
//! 5. begin the image's command buffer; the caller records
//! 6. reset the slot fence, submit waiting image_acquired, signalling
//!    rendering_finished and the fence
//! 7. present waiting rendering_finished (stale or suboptimal: rebuild)
//! 8. advance `current_frame`
//! ```
//!
//! Transient presentation failures never reach the caller: a frame either
//! comes back from [`FrameScheduler::acquire_frame`] or it does not.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, trace, warn};

use framepace_core::{PresentModePreference, RenderConfig};
use framepace_rhi::command::{CommandBuffer, CommandPool};
use framepace_rhi::swapchain::{Swapchain, SwapchainConfig, resolve_swapchain};
use framepace_rhi::sync::SlotSync;
use framepace_rhi::{RhiResult, SharedDevice, Submission};

use crate::per_frame::{FrameCounts, InFlight, PerFrame, Presentable};
use crate::retire::RetireQueue;

/// Pipeline stage at which a frame's commands wait for the acquired image.
const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

/// Maps the configured preference onto a Vulkan present mode.
pub fn present_mode_for(preference: PresentModePreference) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

/// A frame between [`FrameScheduler::acquire_frame`] and
/// [`FrameScheduler::submit_frame`].
///
/// The handle is consumed by `submit_frame`; dropping it instead leaves the
/// scheduler recording, and the next `acquire_frame` is fatal.
#[derive(Debug)]
pub struct FrameHandle {
    /// In-flight slot the frame occupies.
    frame_id: usize,
    /// Swapchain image the frame renders to.
    image_index: u32,
    /// Per-image command buffer, already begun.
    command_buffer: CommandBuffer,
    /// Swapchain extent at acquisition.
    extent: vk::Extent2D,
    /// Rebuild counter of the swapchain the image belongs to.
    surface_generation: u64,
}

impl FrameHandle {
    /// In-flight slot the frame occupies.
    #[inline]
    pub fn frame_id(&self) -> usize {
        self.frame_id
    }

    /// Index of the acquired swapchain image.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Command buffer in the recording state.
    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    /// Extent of the swapchain the image was acquired from.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Swapchain generation the frame was acquired from.
    #[inline]
    pub fn surface_generation(&self) -> u64 {
        self.surface_generation
    }
}

/// Description of a freshly built swapchain.
///
/// Delivered to the render graph and to every listener registered with
/// [`crate::RenderContext::on_surface_recreated`]. The images and views stay
/// valid until the next rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceRecreated {
    /// Extent of every swapchain image.
    pub extent: vk::Extent2D,
    /// Format of every swapchain image.
    pub format: vk::Format,
    /// Swapchain images, indexed by presentable image index.
    pub images: Vec<vk::Image>,
    /// One view per image, same order.
    pub views: Vec<vk::ImageView>,
    /// Increases by one with every rebuild.
    pub generation: u64,
}

impl SurfaceRecreated {
    /// Number of presentable images.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Synchronization of one in-flight slot.
struct SlotState {
    sync: SlotSync,
    /// No submission has signalled the fence since it was last waited on.
    observed: bool,
}

struct ImageData {
    command_buffer: CommandBuffer,
    /// In-flight slot whose submission last rendered to this image.
    last_slot: Option<usize>,
}

/// Frame pacing for one surface.
///
/// Owned and driven by a single submission thread. At most
/// `frames_in_flight` frames are submitted but not yet observed complete:
/// frame `N + frames_in_flight` starts recording only after frame `N`'s
/// fence has been waited on.
pub struct FrameScheduler {
    device: SharedDevice,
    /// Shared with every [`PerFrame`] so `current()` follows this scheduler.
    counts: Arc<FrameCounts>,
    surface: vk::SurfaceKHR,
    /// Pool of the submission thread; per-image buffers come from it.
    command_pool: Arc<CommandPool>,
    /// `None` until the surface first has a non-zero extent.
    swapchain: Option<Swapchain>,
    slots: PerFrame<SlotState, InFlight>,
    images: PerFrame<ImageData, Presentable>,
    /// Destructors parked until their slot's fence is observed.
    retire: RetireQueue,
    present_mode: vk::PresentModeKHR,
    preferred_image_count: Option<u32>,
    /// Last size passed to [`Self::resize`].
    window_extent: vk::Extent2D,
    /// In-flight slot the next frame uses.
    current_frame: usize,
    /// A frame was acquired and not yet submitted.
    recording: bool,
    /// The swapchain must be rebuilt before the next acquire.
    dirty: bool,
    /// Incremented by every successful rebuild.
    surface_generation: u64,
    /// Rebuild not yet handed to [`Self::take_surface_recreated`].
    pending_recreated: Option<SurfaceRecreated>,
}

impl FrameScheduler {
    /// Creates the per-slot synchronization objects and, unless the window
    /// is zero-sized, the first swapchain.
    ///
    /// # Arguments
    ///
    /// * `device` - Device every object is created on
    /// * `counts` - Frame counts shared with the caller's [`PerFrame`]s; the
    ///   in-flight count decides the number of slots
    /// * `command_pool` - Pool of the thread that will drive the frames
    /// * `surface` - Surface to present to
    /// * `width`, `height` - Current drawable size of the window
    /// * `config` - Present mode and image count preferences
    ///
    /// # Errors
    ///
    /// Fails if a synchronization object or the swapchain cannot be created.
    pub fn new(
        device: SharedDevice,
        counts: Arc<FrameCounts>,
        command_pool: Arc<CommandPool>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        config: &RenderConfig,
    ) -> RhiResult<Self> {
        let slots = PerFrame::try_new(&counts, |_| {
            SlotSync::new(device.clone()).map(|sync| SlotState {
                sync,
                observed: true,
            })
        })?;
        let images = PerFrame::try_new(&counts, |_| {
            command_pool
                .allocate_command_buffer()
                .map(|command_buffer| ImageData {
                    command_buffer,
                    last_slot: None,
                })
        })?;
        let retire = RetireQueue::new(slots.max_instance_count());

        let mut scheduler = Self {
            device,
            counts,
            surface,
            command_pool,
            swapchain: None,
            slots,
            images,
            retire,
            present_mode: present_mode_for(config.present_mode),
            preferred_image_count: config.preferred_image_count,
            window_extent: vk::Extent2D { width, height },
            current_frame: 0,
            recording: false,
            dirty: true,
            surface_generation: 0,
            pending_recreated: None,
        };
        scheduler.rebuild()?;

        info!(
            "Frame scheduler ready: {} frame(s) in flight on '{}'",
            scheduler.slots.max_instance_count(),
            scheduler.device.name()
        );
        Ok(scheduler)
    }

    // ========================================================================== //
    // Frame loop
    // ========================================================================== //

    /// Starts the next frame.
    ///
    /// Waits on the current slot's fence, acquires an image and begins its
    /// command buffer.
    ///
    /// # Returns
    ///
    /// `None` when this tick should be skipped: zero-area window or surface,
    /// swapchain rebuilt, or acquisition failed. Nothing is submitted for a
    /// skipped tick.
    ///
    /// # Panics
    ///
    /// Fatal if the previous frame was not submitted, or if waiting on a
    /// fence, rebuilding the swapchain or beginning the command buffer fails.
    pub fn acquire_frame(&mut self) -> Option<FrameHandle> {
        if self.recording {
            fatal!("acquire_frame called before the previous frame was submitted");
        }

        let frame_id = self.current_frame;
        self.observe_slot(frame_id);

        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            trace!("Drawable area is zero, skipping frame");
            return None;
        }
        // The surface itself may report a zero extent while the window does
        // not; the old swapchain must not be used then.
        if (self.swapchain.is_none() || self.dirty) && !self.rebuild_or_fatal() {
            trace!("No swapchain for the current surface, skipping frame");
            return None;
        }

        let semaphore = self.slots[frame_id].sync.image_acquired().handle();
        let acquired = self.swapchain.as_ref()?.acquire_next_image(semaphore);
        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("Acquired image from a suboptimal swapchain");
                    self.dirty = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on acquire, rebuilding");
                self.rebuild_or_fatal();
                return None;
            }
            Err(e) => {
                warn!("Failed to acquire swapchain image ({:?}), dropping frame", e);
                return None;
            }
        };

        let image = image_index as usize;
        if let Some(last) = self.images[image].last_slot
            && last != frame_id
            && !self.slots[last].observed
        {
            trace!("Image {} still owned by slot {}, waiting", image, last);
            self.observe_slot(last);
        }
        self.images[image].last_slot = Some(frame_id);
        self.counts.set_current_image(image);

        let command_buffer = self.images[image].command_buffer.clone();
        if let Err(e) = command_buffer.reset().and_then(|()| command_buffer.begin()) {
            fatal!("Failed to begin command buffer for image {}: {}", image, e);
        }
        self.recording = true;

        Some(FrameHandle {
            frame_id,
            image_index,
            command_buffer,
            extent: self.extent(),
            surface_generation: self.surface_generation,
        })
    }

    /// Submits and presents a frame returned by [`Self::acquire_frame`],
    /// then advances to the next in-flight slot.
    ///
    /// A stale or suboptimal present rebuilds the swapchain before
    /// returning.
    ///
    /// # Panics
    ///
    /// Fatal if `frame` is not the frame being recorded, or if ending,
    /// submitting or presenting fails for any reason other than a stale
    /// swapchain.
    pub fn submit_frame(&mut self, frame: FrameHandle) {
        if !self.recording || frame.frame_id != self.current_frame {
            fatal!(
                "submit_frame called with frame {} while slot {} is current",
                frame.frame_id,
                self.current_frame
            );
        }
        self.recording = false;

        if let Err(e) = frame.command_buffer.end() {
            fatal!("Failed to end frame command buffer: {}", e);
        }

        let slot = &mut self.slots[frame.frame_id];
        if let Err(e) = slot.sync.frame_complete().reset() {
            fatal!("Failed to reset frame fence: {}", e);
        }
        slot.observed = false;

        let wait_semaphores = [slot.sync.image_acquired().handle()];
        let wait_stages = [ACQUIRE_WAIT_STAGE];
        let signal_semaphores = [slot.sync.rendering_finished().handle()];
        let command_buffers = [frame.command_buffer.handle()];
        let submission = Submission {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
            fence: slot.sync.frame_complete().handle(),
        };
        if let Err(e) = self.device.queue_submit(&submission) {
            fatal!("Failed to submit frame {}: {}", frame.frame_id, e);
        }

        let stale = match self.swapchain.as_ref() {
            Some(swapchain) => match swapchain.present(frame.image_index, signal_semaphores[0]) {
                Ok(suboptimal) => suboptimal,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
                Err(e) => fatal!("Failed to present image {}: {:?}", frame.image_index, e),
            },
            None => fatal!("submit_frame without a swapchain"),
        };

        self.current_frame = (frame.frame_id + 1) % self.slots.max_instance_count();
        self.counts.set_current_frame(self.current_frame);

        if stale || self.dirty {
            debug!("Swapchain stale after present, rebuilding");
            self.rebuild_or_fatal();
        }
    }

    /// Waits until the slot's last submission has completed and retires
    /// what was parked on it.
    fn observe_slot(&mut self, slot_id: usize) {
        let slot = &mut self.slots[slot_id];
        if !slot.observed {
            if let Err(e) = slot.sync.frame_complete().wait(u64::MAX) {
                fatal!("Failed waiting for frame slot {}: {}", slot_id, e);
            }
            slot.observed = true;
        }
        self.retire.drain(slot_id);
    }

    // ========================================================================== //
    // Surface
    // ========================================================================== //

    /// Records a new drawable size. The swapchain is rebuilt on the next
    /// frame; a zero dimension makes frames skip until it grows.
    ///
    /// # Arguments
    ///
    /// * `width`, `height` - New drawable size in pixels
    pub fn resize(&mut self, width: u32, height: u32) {
        let extent = vk::Extent2D { width, height };
        if extent != self.window_extent {
            debug!("Drawable resized to {}x{}", width, height);
            self.window_extent = extent;
            self.dirty = true;
        }
    }

    /// Returns whether a swapchain was built. Errors are fatal.
    fn rebuild_or_fatal(&mut self) -> bool {
        match self.rebuild() {
            Ok(built) => built,
            Err(e) => fatal!("Failed to rebuild swapchain: {}", e),
        }
    }

    /// Rebuilds the swapchain and everything sized by it.
    ///
    /// A zero-area window or surface leaves the scheduler dirty so the
    /// rebuild is retried later, without waiting for the device.
    ///
    /// # Returns
    ///
    /// Whether a swapchain was built for the current surface.
    ///
    /// # Errors
    ///
    /// Fails if the surface cannot be queried, the device is lost, or the
    /// swapchain, command buffers or semaphores cannot be created.
    fn rebuild(&mut self) -> RhiResult<bool> {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            debug!("Deferring swapchain rebuild: drawable area is zero");
            self.dirty = true;
            return Ok(false);
        }

        let support = self.device.surface_support(self.surface)?;
        let config = SwapchainConfig {
            width: self.window_extent.width,
            height: self.window_extent.height,
            present_mode: self.present_mode,
            preferred_image_count: self.preferred_image_count,
        };
        let Some(desc) = resolve_swapchain(&support, self.surface, &config, self.swapchain.as_ref())
        else {
            debug!("Deferring swapchain rebuild: surface cannot be presented to");
            self.dirty = true;
            return Ok(false);
        };

        self.device.wait_idle()?;
        for slot in self.slots.iter_mut() {
            slot.observed = true;
        }
        self.retire.drain_all();

        let swapchain = Swapchain::new(self.device.clone(), &desc)?;
        drop(self.swapchain.replace(swapchain));
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(false);
        };

        self.counts.set_image_count(swapchain.image_count() as usize);
        let pool = &self.command_pool;
        let old = self.images.try_recreate(|_| {
            pool.allocate_command_buffer().map(|command_buffer| ImageData {
                command_buffer,
                last_slot: None,
            })
        })?;
        let old_buffers: Vec<CommandBuffer> = old
            .into_iter()
            .map(|data| data.command_buffer)
            .collect();
        self.command_pool.free_command_buffers(&old_buffers);

        for slot in self.slots.iter_mut() {
            slot.sync.recreate_semaphores(self.device.clone())?;
        }

        self.surface_generation += 1;
        self.pending_recreated = Some(SurfaceRecreated {
            extent: swapchain.extent(),
            format: swapchain.format(),
            images: swapchain.images().to_vec(),
            views: swapchain.image_views().to_vec(),
            generation: self.surface_generation,
        });
        self.dirty = false;

        info!(
            "Surface rebuilt (generation {}): {}x{}, {} image(s)",
            self.surface_generation,
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count()
        );
        Ok(true)
    }

    /// The last rebuild not yet handed out, if any.
    ///
    /// Each rebuild is returned once; an older rebuild that was never taken
    /// is superseded by the newer one.
    pub fn take_surface_recreated(&mut self) -> Option<SurfaceRecreated> {
        self.pending_recreated.take()
    }

    // ========================================================================== //
    // Lifetime
    // ========================================================================== //

    /// Destroys `destroy` once no frame in flight can still reference the
    /// object.
    ///
    /// While a frame is being recorded it may use the object, so it is parked
    /// on that frame's slot; otherwise on the most recently submitted slot.
    pub fn defer_until_retired(&mut self, destroy: impl FnOnce() + Send + 'static) {
        let count = self.slots.max_instance_count();
        let slot = if self.recording {
            self.current_frame
        } else {
            (self.current_frame + count - 1) % count
        };
        self.retire.retire(slot, destroy);
    }

    /// Blocks until every submitted frame has completed and runs every
    /// parked destructor whose slot was waited on.
    ///
    /// # Panics
    ///
    /// Fatal if a fence wait fails.
    pub fn wait_for_all_frames(&mut self) {
        for slot in 0..self.slots.max_instance_count() {
            self.observe_slot(slot);
        }
    }

    // ========================================================================== //
    // Accessors
    // ========================================================================== //

    /// Swapchain extent, or the window extent before one exists.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or(self.window_extent, Swapchain::extent)
    }

    /// Current swapchain, `None` before the first non-zero surface.
    #[inline]
    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// In-flight slot the next acquired frame will use.
    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.max_instance_count()
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.max_instance_count()
    }

    /// Number of successful swapchain builds so far.
    #[inline]
    pub fn surface_generation(&self) -> u64 {
        self.surface_generation
    }

    /// A rebuild is pending.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// A frame has been acquired and not yet submitted.
    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Fence guarding in-flight slot `slot`.
    ///
    /// # Panics
    ///
    /// Fatal if `slot` is not below [`Self::frames_in_flight`].
    pub fn slot_fence(&self, slot: usize) -> vk::Fence {
        self.slots[slot].sync.frame_complete().handle()
    }

    /// Objects waiting for their slot's fence.
    pub fn retire_pending(&self) -> usize {
        self.retire.pending()
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during scheduler drop: {}", e);
        }
        self.retire.drain_all();

        let buffers: Vec<CommandBuffer> = self
            .images
            .iter()
            .map(|data| data.command_buffer.clone())
            .collect();
        self.command_pool.free_command_buffers(&buffers);
        self.swapchain = None;
        debug!("Frame scheduler destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepace_rhi::headless::{DeviceEvent, HeadlessDevice};

    fn scheduler(frames_in_flight: usize) -> (Arc<HeadlessDevice>, FrameScheduler) {
        let headless = Arc::new(HeadlessDevice::new());
        let device: SharedDevice = headless.clone();
        let counts = FrameCounts::new(frames_in_flight, 0);
        let pool = Arc::new(CommandPool::new(device.clone(), 0).unwrap());
        let surface = headless.create_surface();
        let config = RenderConfig {
            frames_in_flight,
            ..Default::default()
        };
        let scheduler =
            FrameScheduler::new(device, counts, pool, surface, 800, 600, &config).unwrap();
        (headless, scheduler)
    }

    #[test]
    fn test_present_mode_mapping() {
        assert_eq!(
            present_mode_for(PresentModePreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            present_mode_for(PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn test_new_builds_swapchain() {
        let (device, mut scheduler) = scheduler(2);

        assert_eq!(device.swapchain_creations(), 1);
        assert_eq!(scheduler.image_count(), 3);
        assert_eq!(scheduler.surface_generation(), 1);
        let event = scheduler.take_surface_recreated().unwrap();
        assert_eq!(event.image_count(), 3);
        assert!(scheduler.take_surface_recreated().is_none());
    }

    #[test]
    fn test_frame_round_trip_advances_slot() {
        let (device, mut scheduler) = scheduler(2);

        let frame = scheduler.acquire_frame().unwrap();
        assert_eq!(frame.frame_id(), 0);
        assert!(scheduler.is_recording());
        scheduler.submit_frame(frame);

        assert_eq!(scheduler.current_frame(), 1);
        assert_eq!(device.submission_count(), 1);
        assert_eq!(device.present_count(), 1);
    }

    #[test]
    fn test_suboptimal_acquire_rebuilds_after_present() {
        let (device, mut scheduler) = scheduler(2);
        device.script_acquire(vk::Result::SUBOPTIMAL_KHR);

        let frame = scheduler.acquire_frame().unwrap();
        assert!(scheduler.is_dirty());
        scheduler.submit_frame(frame);

        assert_eq!(device.swapchain_creations(), 2);
        assert!(!scheduler.is_dirty());
    }

    #[test]
    fn test_other_acquire_errors_drop_frame() {
        let (device, mut scheduler) = scheduler(2);
        device.script_acquire(vk::Result::TIMEOUT);

        assert!(scheduler.acquire_frame().is_none());
        assert_eq!(device.swapchain_creations(), 1);
        assert!(scheduler.acquire_frame().is_some());
    }

    #[test]
    fn test_deferred_destruction_waits_for_fence() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (device, mut scheduler) = scheduler(2);
        let destroyed = Arc::new(AtomicBool::new(false));

        let frame = scheduler.acquire_frame().unwrap();
        let flag = Arc::clone(&destroyed);
        scheduler.defer_until_retired(move || flag.store(true, Ordering::SeqCst));
        scheduler.submit_frame(frame);
        assert!(!destroyed.load(Ordering::SeqCst));

        // Slot 1 does not cover the object.
        let frame = scheduler.acquire_frame().unwrap();
        scheduler.submit_frame(frame);
        assert!(!destroyed.load(Ordering::SeqCst));

        // Back on slot 0: its fence is observed before recording.
        let fence = scheduler.slot_fence(0);
        let _frame = scheduler.acquire_frame().unwrap();
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(device.events().contains(&DeviceEvent::FenceWaited(fence)));
    }

    #[test]
    #[should_panic(expected = "before the previous frame was submitted")]
    fn test_double_acquire_is_fatal() {
        let (_device, mut scheduler) = scheduler(2);
        let _first = scheduler.acquire_frame();
        let _second = scheduler.acquire_frame();
    }
}
