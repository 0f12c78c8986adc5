//! Synchronization primitives.
//!
//! - [`Semaphore`] - GPU-to-GPU ordering between queue operations
//! - [`Fence`] - GPU-to-CPU completion, waited on by the host
//! - [`SlotSync`] - the three objects one in-flight frame slot needs
//!
//! # Example
//!
//! ```no_run
//! use framepace_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: framepace_rhi::SharedDevice) -> framepace_rhi::RhiResult<()> {
//! let image_acquired = Semaphore::new(device.clone())?;
//! let frame_complete = Fence::new(device.clone(), true)?;
//!
//! frame_complete.wait(u64::MAX)?;
//! frame_complete.reset()?;
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::debug;

use crate::backend::SharedDevice;
use crate::error::RhiResult;

/// RAII semaphore.
pub struct Semaphore {
    device: SharedDevice,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates an unsignaled binary semaphore.
    pub fn new(device: SharedDevice) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}

/// RAII fence.
pub struct Fence {
    device: SharedDevice,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a fence, optionally already signaled.
    ///
    /// Frame fences start signaled so the first wait on each slot returns
    /// immediately.
    pub fn new(device: SharedDevice, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;
        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled or `timeout` nanoseconds pass.
    ///
    /// # Errors
    ///
    /// `vk::Result::TIMEOUT` when the timeout elapses, `ERROR_DEVICE_LOST` on
    /// a hung GPU.
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        self.device.wait_for_fences(&[self.fence], timeout)
    }

    /// Returns the fence to the unsignaled state.
    ///
    /// Must not be called while a submission that signals it is pending.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fences(&[self.fence])
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> bool {
        matches!(self.device.fence_status(self.fence), Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

/// Synchronization for one in-flight frame slot.
///
/// ```text
/// 1. wait frame_complete
/// 2. acquire, signalling image_acquired
/// 3. reset frame_complete, submit waiting image_acquired,
///    signalling rendering_finished and frame_complete
/// 4. present waiting rendering_finished
/// ```
pub struct SlotSync {
    image_acquired: Semaphore,
    rendering_finished: Semaphore,
    frame_complete: Fence,
}

impl SlotSync {
    /// Creates the slot's objects with the fence signaled.
    pub fn new(device: SharedDevice) -> RhiResult<Self> {
        let image_acquired = Semaphore::new(device.clone())?;
        let rendering_finished = Semaphore::new(device.clone())?;
        let frame_complete = Fence::new(device, true)?;

        Ok(Self {
            image_acquired,
            rendering_finished,
            frame_complete,
        })
    }

    /// Replaces both semaphores.
    ///
    /// An acquire that failed as out-of-date may leave `image_acquired` with
    /// a pending signal, so the semaphores are rebuilt with the swapchain.
    /// The device must be idle.
    pub fn recreate_semaphores(&mut self, device: SharedDevice) -> RhiResult<()> {
        self.image_acquired = Semaphore::new(device.clone())?;
        self.rendering_finished = Semaphore::new(device)?;
        debug!("Recreated slot semaphores");
        Ok(())
    }

    #[inline]
    pub fn image_acquired(&self) -> &Semaphore {
        &self.image_acquired
    }

    #[inline]
    pub fn rendering_finished(&self) -> &Semaphore {
        &self.rendering_finished
    }

    #[inline]
    pub fn frame_complete(&self) -> &Fence {
        &self.frame_complete
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::headless::HeadlessDevice;

    fn device() -> (Arc<HeadlessDevice>, SharedDevice) {
        let headless = Arc::new(HeadlessDevice::new());
        let shared: SharedDevice = headless.clone();
        (headless, shared)
    }

    #[test]
    fn test_signaled_fence_waits_immediately() {
        let (_, device) = device();
        let fence = Fence::new(device, true).unwrap();
        assert!(fence.is_signaled());
        fence.wait(u64::MAX).unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_idle_unsignaled_fence_times_out() {
        let (_, device) = device();
        let fence = Fence::new(device, false).unwrap();
        let err = fence.wait(0).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::TIMEOUT));
    }

    #[test]
    fn test_objects_are_destroyed_on_drop() {
        let (headless, device) = device();
        {
            let _slot = SlotSync::new(device).unwrap();
            assert_eq!(headless.live_objects(), 3);
        }
        assert_eq!(headless.live_objects(), 0);
    }

    #[test]
    fn test_recreate_semaphores_replaces_handles() {
        let (headless, device) = device();
        let mut slot = SlotSync::new(device.clone()).unwrap();
        let before = slot.image_acquired().handle();
        slot.recreate_semaphores(device).unwrap();
        assert_ne!(slot.image_acquired().handle(), before);
        assert_eq!(headless.live_objects(), 3);
    }

    #[test]
    fn test_sync_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
        assert_send_sync::<Fence>();
        assert_send_sync::<SlotSync>();
    }
}
