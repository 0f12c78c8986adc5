//! Per-thread command pools.
//!
//! Vulkan command pools are externally synchronized, so every recording
//! thread gets its own. Pools are created on a thread's first request and
//! destroyed together at shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::{debug, info};

use framepace_rhi::command::{CommandBuffer, CommandPool};
use framepace_rhi::sync::Fence;
use framepace_rhi::{RhiResult, SharedDevice, Submission};

/// Registry of command pools keyed by the thread that records into them.
pub struct CommandPools {
    device: SharedDevice,
    /// Family every pool allocates for; submissions go to its queue
    queue_family_index: u32,
    pools: Mutex<HashMap<ThreadId, Arc<CommandPool>>>,
}

impl CommandPools {
    /// Creates an empty registry for the device's graphics queue family.
    pub fn new(device: SharedDevice) -> Self {
        let queue_family_index = device.graphics_queue_family();
        Self {
            device,
            queue_family_index,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The calling thread's pool, created on first use.
    ///
    /// # Errors
    ///
    /// Fails if the pool cannot be created.
    pub fn get(&self) -> RhiResult<Arc<CommandPool>> {
        let id = thread::current().id();
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(&id) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(CommandPool::new(
            self.device.clone(),
            self.queue_family_index,
        )?);
        debug!("Created command pool for thread {:?}", id);
        pools.insert(id, Arc::clone(&pool));
        Ok(pool)
    }

    /// Number of threads that have requested a pool so far.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    /// Records `record` into a fresh command buffer from the calling thread's
    /// pool, submits it and blocks until the GPU has executed it.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use framepace_renderer::command_pools::CommandPools;
    /// use framepace_rhi::headless::HeadlessDevice;
    ///
    /// let pools = CommandPools::new(Arc::new(HeadlessDevice::new()));
    /// pools.one_shot(|cmd| cmd.begin_label("upload")).unwrap();
    /// ```
    pub fn one_shot<R>(&self, record: impl FnOnce(&CommandBuffer) -> R) -> RhiResult<R> {
        let pool = self.get()?;
        let command_buffer = pool.allocate_command_buffer()?;

        let result = Self::record_and_wait(&self.device, &command_buffer, record);
        pool.free_command_buffer(&command_buffer);
        result
    }

    fn record_and_wait<R>(
        device: &SharedDevice,
        command_buffer: &CommandBuffer,
        record: impl FnOnce(&CommandBuffer) -> R,
    ) -> RhiResult<R> {
        command_buffer.begin()?;
        let result = record(command_buffer);
        command_buffer.end()?;

        let fence = Fence::new(device.clone(), false)?;
        let command_buffers = [command_buffer.handle()];
        device.queue_submit(&Submission {
            command_buffers: &command_buffers,
            fence: fence.handle(),
            ..Default::default()
        })?;
        fence.wait(u64::MAX)?;
        Ok(result)
    }

    /// Destroys every registered pool.
    ///
    /// All GPU work recorded from these pools must have completed.
    pub fn destroy_pools(&self) {
        let mut pools = self.pools.lock().unwrap();
        let count = pools.len();
        pools.clear();
        if count > 0 {
            info!("Destroyed {} command pool(s)", count);
        }
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

impl Drop for CommandPools {
    fn drop(&mut self) {
        self.destroy_pools();
    }
}

impl std::fmt::Debug for CommandPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPools")
            .field("queue_family_index", &self.queue_family_index)
            .field("pools", &self.pool_count())
            .finish()
    }
}
