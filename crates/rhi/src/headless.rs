//! In-process device for exercising frame pacing without a GPU.
//!
//! [`HeadlessDevice`] fabricates handles, enforces the object-state rules a
//! driver's validation layer would (fences submitted while signaled, command
//! buffers re-recorded while pending, semaphores waited without a signal,
//! exhausted descriptor pools) and records an ordered [`DeviceEvent`] log.
//!
//! Submitted work completes when its fence is waited on, or on
//! [`GpuDevice::wait_idle`]. Acquire and present results can be scripted to
//! simulate stale or suboptimal surfaces, and the surface extent can be set
//! to zero to simulate a minimized window.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};
use tracing::{debug, trace};

use crate::backend::{
    AttachmentDesc, AttachmentImage, GpuDevice, RenderTarget, Submission, SwapchainDesc,
    SwapchainImages,
};
use crate::error::{RhiError, RhiResult};
use crate::swapchain::SurfaceSupport;

/// One observable device operation, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A host wait returned with the fence signaled.
    FenceWaited(vk::Fence),
    FenceReset(vk::Fence),
    CommandBufferBegun(vk::CommandBuffer),
    Submitted {
        command_buffers: Vec<vk::CommandBuffer>,
        fence: vk::Fence,
    },
    ImageAcquired {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    Presented {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    SwapchainCreated {
        swapchain: vk::SwapchainKHR,
        extent: vk::Extent2D,
        image_count: u32,
    },
    SwapchainDestroyed(vk::SwapchainKHR),
    LabelBegun(String),
    LabelEnded,
    RenderingBegun {
        extent: vk::Extent2D,
        attachments: usize,
    },
    RenderingEnded,
    ImageTransitioned {
        image: vk::Image,
        new_layout: vk::ImageLayout,
    },
    AttachmentCreated {
        image: vk::Image,
        extent: vk::Extent2D,
    },
    AttachmentDestroyed(vk::Image),
    WaitIdle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferState {
    Initial,
    Recording,
    Executable,
    Pending(vk::Fence),
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next_image: u32,
    retired: bool,
}

struct DescriptorPoolState {
    max_sets: u32,
    capacity: HashMap<vk::DescriptorType, u32>,
    used: HashMap<vk::DescriptorType, u32>,
    sets: HashMap<vk::DescriptorSet, vk::DescriptorSetLayout>,
}

#[derive(Default)]
struct State {
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashMap<vk::Semaphore, bool>,
    command_pools: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    command_buffers: HashMap<vk::CommandBuffer, BufferState>,
    layouts: HashMap<vk::DescriptorSetLayout, HashMap<vk::DescriptorType, u32>>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    attachments: HashMap<vk::Image, vk::ImageView>,
    support: Option<SurfaceSupport>,
    acquire_script: VecDeque<vk::Result>,
    acquire_indices: VecDeque<u32>,
    present_script: VecDeque<Result<bool, vk::Result>>,
    events: Vec<DeviceEvent>,
}

/// A [`GpuDevice`] that runs entirely on the host.
pub struct HeadlessDevice {
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// A device whose surface is 800x600 and supports two to three images,
    /// FIFO and MAILBOX, and opaque composition.
    pub fn new() -> Self {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 8192,
                    height: 8192,
                },
                max_image_array_layers: 1,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        Self {
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State {
                support: Some(support),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fabricate<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// A surface handle to pass to the frame scheduler.
    pub fn create_surface(&self) -> vk::SurfaceKHR {
        self.fabricate()
    }

    // ========================================================================== //
    // Scripting
    // ========================================================================== //

    /// Sets the surface's current extent. Zero simulates a minimized window.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        if let Some(support) = self.state().support.as_mut() {
            support.capabilities.current_extent = vk::Extent2D { width, height };
        }
    }

    /// Sets the surface's image count limits.
    pub fn set_image_count_limits(&self, min: u32, max: u32) {
        if let Some(support) = self.state().support.as_mut() {
            support.capabilities.min_image_count = min;
            support.capabilities.max_image_count = max;
        }
    }

    /// Sets the composite alpha and transform flags the surface reports.
    pub fn set_surface_flags(
        &self,
        composite_alpha: vk::CompositeAlphaFlagsKHR,
        transforms: vk::SurfaceTransformFlagsKHR,
        current_transform: vk::SurfaceTransformFlagsKHR,
    ) {
        if let Some(support) = self.state().support.as_mut() {
            support.capabilities.supported_composite_alpha = composite_alpha;
            support.capabilities.supported_transforms = transforms;
            support.capabilities.current_transform = current_transform;
        }
    }

    /// The next acquire returns `result` instead of an image.
    /// `SUBOPTIMAL_KHR` acquires an image and reports it suboptimal.
    pub fn script_acquire(&self, result: vk::Result) {
        self.state().acquire_script.push_back(result);
    }

    /// Forces the image indices handed out by upcoming acquires.
    pub fn script_acquire_index(&self, image_index: u32) {
        self.state().acquire_indices.push_back(image_index);
    }

    /// The next present returns `result`.
    pub fn script_present(&self, result: Result<bool, vk::Result>) {
        self.state().present_script.push_back(result);
    }

    // ========================================================================== //
    // Inspection
    // ========================================================================== //

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Number of logged events matching `predicate`.
    pub fn count_events(&self, predicate: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.state().events.iter().filter(|e| predicate(e)).count()
    }

    pub fn submission_count(&self) -> usize {
        self.count_events(|e| matches!(e, DeviceEvent::Submitted { .. }))
    }

    pub fn present_count(&self) -> usize {
        self.count_events(|e| matches!(e, DeviceEvent::Presented { .. }))
    }

    pub fn swapchain_creations(&self) -> usize {
        self.count_events(|e| matches!(e, DeviceEvent::SwapchainCreated { .. }))
    }

    /// Live fences, semaphores, pools, layouts, swapchains and attachments.
    pub fn live_objects(&self) -> usize {
        let state = self.state();
        state.fences.len()
            + state.semaphores.len()
            + state.command_pools.len()
            + state.layouts.len()
            + state.descriptor_pools.len()
            + state.swapchains.len()
            + state.attachments.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state().command_buffers.len()
    }

    pub fn live_descriptor_pools(&self) -> usize {
        self.state().descriptor_pools.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state()
            .descriptor_pools
            .values()
            .map(|pool| pool.sets.len())
            .sum()
    }

    /// Whether work signalling `fence` has been submitted and not yet waited.
    pub fn fence_pending(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence) == Some(&FenceState::Pending)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(what: &str, handle: impl Handle) -> RhiError {
    RhiError::InvalidHandle(format!("{what} {:#x}", handle.as_raw()))
}

fn tally(sizes: impl Iterator<Item = (vk::DescriptorType, u32)>) -> HashMap<vk::DescriptorType, u32> {
    let mut counts = HashMap::new();
    for (kind, count) in sizes {
        *counts.entry(kind).or_insert(0) += count;
    }
    counts
}

impl State {
    /// Completes the work behind `fence` and every buffer it covers.
    fn complete(&mut self, fence: vk::Fence) {
        self.fences.insert(fence, FenceState::Signaled);
        for state in self.command_buffers.values_mut() {
            if *state == BufferState::Pending(fence) {
                *state = BufferState::Executable;
            }
        }
    }

    fn check_recordable(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        match self.command_buffers.get(&command_buffer) {
            None => Err(invalid("command buffer", command_buffer)),
            Some(BufferState::Pending(fence))
                if self.fences.get(fence) == Some(&FenceState::Pending) =>
            {
                Err(RhiError::InvalidHandle(format!(
                    "command buffer {:#x} reused before fence {:#x} was observed",
                    command_buffer.as_raw(),
                    fence.as_raw()
                )))
            }
            Some(_) => Ok(()),
        }
    }

    fn consume_semaphore(&mut self, semaphore: vk::Semaphore) -> RhiResult<()> {
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) if *signaled => {
                *signaled = false;
                Ok(())
            }
            Some(_) => Err(invalid("wait on unsignaled semaphore", semaphore)),
            None => Err(invalid("semaphore", semaphore)),
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence = self.fabricate();
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        self.state().fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state().fences.remove(&fence);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> RhiResult<()> {
        let mut state = self.state();
        for &fence in fences {
            match state.fences.get(&fence).copied() {
                None => return Err(invalid("fence", fence)),
                Some(FenceState::Unsignaled) => return Err(vk::Result::TIMEOUT.into()),
                Some(FenceState::Pending) => state.complete(fence),
                Some(FenceState::Signaled) => {}
            }
            state.events.push(DeviceEvent::FenceWaited(fence));
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state();
        for &fence in fences {
            match state.fences.get(&fence).copied() {
                None => return Err(invalid("fence", fence)),
                Some(FenceState::Pending) => return Err(invalid("reset of pending fence", fence)),
                Some(_) => {
                    state.fences.insert(fence, FenceState::Unsignaled);
                    state.events.push(DeviceEvent::FenceReset(fence));
                }
            }
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        match self.state().fences.get(&fence) {
            Some(status) => Ok(*status == FenceState::Signaled),
            None => Err(invalid("fence", fence)),
        }
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let semaphore = self.fabricate();
        self.state().semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state().semaphores.remove(&semaphore);
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let pool = self.fabricate();
        self.state().command_pools.insert(pool, Vec::new());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        if let Some(buffers) = state.command_pools.remove(&pool) {
            for buffer in buffers {
                state.command_buffers.remove(&buffer);
            }
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let mut state = self.state();
        let buffers = state
            .command_pools
            .get(&pool)
            .cloned()
            .ok_or_else(|| invalid("command pool", pool))?;
        for buffer in &buffers {
            state.check_recordable(*buffer)?;
        }
        for buffer in buffers {
            state.command_buffers.insert(buffer, BufferState::Initial);
        }
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| self.fabricate()).collect();
        let mut state = self.state();
        let owned = state
            .command_pools
            .get_mut(&pool)
            .ok_or_else(|| invalid("command pool", pool))?;
        owned.extend_from_slice(&buffers);
        for &buffer in &buffers {
            state.command_buffers.insert(buffer, BufferState::Initial);
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state();
        if let Some(owned) = state.command_pools.get_mut(&pool) {
            owned.retain(|b| !buffers.contains(b));
        }
        for buffer in buffers {
            state.command_buffers.remove(buffer);
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let mut state = self.state();
        state.check_recordable(command_buffer)?;
        state
            .command_buffers
            .insert(command_buffer, BufferState::Recording);
        state
            .events
            .push(DeviceEvent::CommandBufferBegun(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state();
        match state.command_buffers.get(&command_buffer) {
            Some(BufferState::Recording) => {
                state
                    .command_buffers
                    .insert(command_buffer, BufferState::Executable);
                Ok(())
            }
            Some(_) => Err(invalid("end of command buffer not recording", command_buffer)),
            None => Err(invalid("command buffer", command_buffer)),
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state();
        state.check_recordable(command_buffer)?;
        state
            .command_buffers
            .insert(command_buffer, BufferState::Initial);
        Ok(())
    }

    fn queue_submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let mut state = self.state();

        for buffer in submission.command_buffers {
            if state.command_buffers.get(buffer) != Some(&BufferState::Executable) {
                return Err(invalid("submit of non-executable command buffer", *buffer));
            }
        }
        if submission.fence != vk::Fence::null() {
            match state.fences.get(&submission.fence) {
                Some(FenceState::Unsignaled) => {}
                Some(_) => return Err(invalid("submit with signaled fence", submission.fence)),
                None => return Err(invalid("fence", submission.fence)),
            }
        }
        for &semaphore in submission.wait_semaphores {
            state.consume_semaphore(semaphore)?;
        }
        for semaphore in submission.signal_semaphores {
            state.semaphores.insert(*semaphore, true);
        }

        for &buffer in submission.command_buffers {
            state
                .command_buffers
                .insert(buffer, BufferState::Pending(submission.fence));
        }
        if submission.fence != vk::Fence::null() {
            state.fences.insert(submission.fence, FenceState::Pending);
        } else {
            // Nothing to observe: the work is considered complete.
            for &buffer in submission.command_buffers {
                state.command_buffers.insert(buffer, BufferState::Executable);
            }
        }

        state.events.push(DeviceEvent::Submitted {
            command_buffers: submission.command_buffers.to_vec(),
            fence: submission.fence,
        });
        trace!(
            "Headless submit of {} command buffer(s)",
            submission.command_buffers.len()
        );
        Ok(())
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let mut state = self.state();
        if state.consume_semaphore(wait_semaphore).is_err() {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let retired = match state.swapchains.get(&swapchain) {
            Some(chain) => chain.retired,
            None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        };

        let result = match state.present_script.pop_front() {
            Some(result) => result,
            None if retired => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            None => Ok(false),
        };
        if result.is_ok() {
            state.events.push(DeviceEvent::Presented {
                swapchain,
                image_index,
            });
        }
        result
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state();
        let pending: Vec<vk::Fence> = state
            .fences
            .iter()
            .filter(|(_, s)| **s == FenceState::Pending)
            .map(|(f, _)| *f)
            .collect();
        for fence in pending {
            state.complete(fence);
        }
        for buffer in state.command_buffers.values_mut() {
            if let BufferState::Pending(_) = buffer {
                *buffer = BufferState::Executable;
            }
        }
        state.events.push(DeviceEvent::WaitIdle);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let layout = self.fabricate();
        let counts = tally(bindings.iter().map(|b| (b.descriptor_type, b.descriptor_count)));
        self.state().layouts.insert(layout, counts);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state().layouts.remove(&layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let pool = self.fabricate();
        let capacity = tally(pool_sizes.iter().map(|s| (s.ty, s.descriptor_count)));
        self.state().descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets,
                capacity,
                used: HashMap::new(),
                sets: HashMap::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state().descriptor_pools.remove(&pool);
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let set = self.fabricate();
        let mut state = self.state();
        let needed = state
            .layouts
            .get(&layout)
            .cloned()
            .ok_or_else(|| invalid("descriptor set layout", layout))?;
        let pool_state = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| invalid("descriptor pool", pool))?;

        let sets_full = pool_sets(pool_state) >= pool_state.max_sets;
        let kinds_full = needed.iter().any(|(kind, count)| {
            let used = pool_state.used.get(kind).copied().unwrap_or(0);
            let capacity = pool_state.capacity.get(kind).copied().unwrap_or(0);
            used + count > capacity
        });
        if sets_full || kinds_full {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into());
        }

        for (kind, count) in &needed {
            *pool_state.used.entry(*kind).or_insert(0) += count;
        }
        pool_state.sets.insert(set, layout);
        Ok(set)
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> RhiResult<()> {
        let mut state = self.state();
        let pool_state = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| invalid("descriptor pool", pool))?;
        let layout = pool_state
            .sets
            .remove(&set)
            .ok_or_else(|| invalid("descriptor set", set))?;
        let freed = state.layouts.get(&layout).cloned().unwrap_or_default();
        if let Some(pool_state) = state.descriptor_pools.get_mut(&pool) {
            for (kind, count) in freed {
                if let Some(used) = pool_state.used.get_mut(&kind) {
                    *used = used.saturating_sub(count);
                }
            }
        }
        Ok(())
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> RhiResult<SurfaceSupport> {
        self.state()
            .support
            .clone()
            .ok_or_else(|| invalid("surface", surface))
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<SwapchainImages> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::SwapchainError(
                "zero-area swapchain requested".to_string(),
            ));
        }

        let swapchain: vk::SwapchainKHR = self.fabricate();
        let images: Vec<vk::Image> = (0..desc.min_image_count).map(|_| self.fabricate()).collect();
        let views: Vec<vk::ImageView> = (0..desc.min_image_count).map(|_| self.fabricate()).collect();

        let mut state = self.state();
        if let Some(old) = state.swapchains.get_mut(&desc.old_swapchain) {
            old.retired = true;
        }
        state.swapchains.insert(
            swapchain,
            SwapchainState {
                images: images.clone(),
                next_image: 0,
                retired: false,
            },
        );
        state.events.push(DeviceEvent::SwapchainCreated {
            swapchain,
            extent: desc.extent,
            image_count: desc.min_image_count,
        });
        debug!(
            "Headless swapchain {:#x}: {}x{}, {} images",
            swapchain.as_raw(),
            desc.extent.width,
            desc.extent.height,
            desc.min_image_count
        );

        Ok(SwapchainImages {
            swapchain,
            images,
            views,
        })
    }

    fn destroy_swapchain(&self, images: &SwapchainImages) {
        let mut state = self.state();
        if state.swapchains.remove(&images.swapchain).is_some() {
            state
                .events
                .push(DeviceEvent::SwapchainDestroyed(images.swapchain));
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = self.state();
        let scripted = state.acquire_script.pop_front();
        let suboptimal = match scripted {
            None => false,
            Some(vk::Result::SUBOPTIMAL_KHR) => true,
            Some(error) => return Err(error),
        };

        let forced = state.acquire_indices.pop_front();
        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if chain.retired {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let count = chain.images.len() as u32;
        let image_index = forced.unwrap_or(chain.next_image) % count;
        chain.next_image = (image_index + 1) % count;

        match state.semaphores.get_mut(&semaphore) {
            Some(signaled) if !*signaled => *signaled = true,
            _ => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        }
        state.events.push(DeviceEvent::ImageAcquired {
            swapchain,
            image_index,
        });
        Ok((image_index, suboptimal))
    }

    fn create_attachment(
        &self,
        desc: &AttachmentDesc,
        extent: vk::Extent2D,
    ) -> RhiResult<AttachmentImage> {
        let image = self.fabricate();
        let view = self.fabricate();
        let mut state = self.state();
        state.attachments.insert(image, view);
        state
            .events
            .push(DeviceEvent::AttachmentCreated { image, extent });
        Ok(AttachmentImage {
            image,
            view,
            format: desc.format,
            extent,
        })
    }

    fn destroy_attachment(&self, attachment: &AttachmentImage) {
        let mut state = self.state();
        if state.attachments.remove(&attachment.image).is_some() {
            state
                .events
                .push(DeviceEvent::AttachmentDestroyed(attachment.image));
        }
    }

    fn cmd_begin_label(&self, _command_buffer: vk::CommandBuffer, label: &str) {
        self.state()
            .events
            .push(DeviceEvent::LabelBegun(label.to_string()));
    }

    fn cmd_end_label(&self, _command_buffer: vk::CommandBuffer) {
        self.state().events.push(DeviceEvent::LabelEnded);
    }

    fn cmd_begin_rendering(&self, _command_buffer: vk::CommandBuffer, target: &RenderTarget<'_>) {
        self.state().events.push(DeviceEvent::RenderingBegun {
            extent: target.extent,
            attachments: target.attachments.len(),
        });
    }

    fn cmd_end_rendering(&self, _command_buffer: vk::CommandBuffer) {
        self.state().events.push(DeviceEvent::RenderingEnded);
    }

    fn cmd_set_viewport_scissor(&self, _command_buffer: vk::CommandBuffer, _extent: vk::Extent2D) {}

    fn cmd_transition_image(
        &self,
        _command_buffer: vk::CommandBuffer,
        image: vk::Image,
        _aspect: vk::ImageAspectFlags,
        _old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.state()
            .events
            .push(DeviceEvent::ImageTransitioned { image, new_layout });
    }
}

fn pool_sets(pool: &DescriptorPoolState) -> u32 {
    pool.sets.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executable_buffer(device: &HeadlessDevice) -> vk::CommandBuffer {
        let pool = device
            .create_command_pool(0, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        device.end_command_buffer(cmd).unwrap();
        cmd
    }

    #[test]
    fn test_submitted_fence_signals_on_wait() {
        let device = HeadlessDevice::new();
        let cmd = executable_buffer(&device);
        let fence = device.create_fence(false).unwrap();

        device
            .queue_submit(&Submission {
                command_buffers: &[cmd],
                fence,
                ..Default::default()
            })
            .unwrap();
        assert!(device.fence_pending(fence));
        assert!(!device.fence_status(fence).unwrap());

        device.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert!(device.fence_status(fence).unwrap());
    }

    #[test]
    fn test_rerecording_pending_buffer_is_rejected() {
        let device = HeadlessDevice::new();
        let cmd = executable_buffer(&device);
        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(&Submission {
                command_buffers: &[cmd],
                fence,
                ..Default::default()
            })
            .unwrap();

        assert!(device.reset_command_buffer(cmd).is_err());
        device.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert!(device.reset_command_buffer(cmd).is_ok());
    }

    #[test]
    fn test_submit_with_signaled_fence_is_rejected() {
        let device = HeadlessDevice::new();
        let cmd = executable_buffer(&device);
        let fence = device.create_fence(true).unwrap();
        let result = device.queue_submit(&Submission {
            command_buffers: &[cmd],
            fence,
            ..Default::default()
        });
        assert!(matches!(result, Err(RhiError::InvalidHandle(_))));
    }

    #[test]
    fn test_wait_on_unsignaled_semaphore_is_rejected() {
        let device = HeadlessDevice::new();
        let cmd = executable_buffer(&device);
        let semaphore = device.create_semaphore().unwrap();
        let result = device.queue_submit(&Submission {
            command_buffers: &[cmd],
            wait_semaphores: &[semaphore],
            wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_scripted_acquire_and_present() {
        let device = HeadlessDevice::new();
        let images = device
            .create_swapchain(&SwapchainDesc {
                surface: device.create_surface(),
                min_image_count: 2,
                format: vk::SurfaceFormatKHR::default(),
                extent: vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                present_mode: vk::PresentModeKHR::FIFO,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.script_acquire(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(
            device.acquire_next_image(images.swapchain, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );

        device.script_acquire_index(1);
        assert_eq!(
            device.acquire_next_image(images.swapchain, semaphore),
            Ok((1, false))
        );

        device.script_present(Ok(true));
        assert_eq!(
            device.queue_present(images.swapchain, 1, semaphore),
            Ok(true)
        );
        assert_eq!(device.present_count(), 1);
    }

    #[test]
    fn test_descriptor_capacity_is_tracked_per_kind() {
        let device = HeadlessDevice::new();
        let binding = vk::DescriptorSetLayoutBinding::default()
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(2);
        let layout = device.create_descriptor_set_layout(&[binding]).unwrap();
        let pool = device
            .create_descriptor_pool(
                8,
                &[vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(3)],
            )
            .unwrap();

        let set = device.allocate_descriptor_set(pool, layout).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_err());
        device.free_descriptor_set(pool, set).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert_eq!(device.live_descriptor_sets(), 1);
    }
}
