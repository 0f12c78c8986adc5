//! Descriptor set allocation from a growing bank of pools.
//!
//! Each pool has a fixed capacity (sets and descriptors per kind) and
//! belongs to the thread that created it. [`DescriptorAllocator::allocate`]
//! takes the first of the calling thread's pools with room for the request
//! and creates a new pool when none has. Capacity is tracked with atomic
//! counters; the allocator's mutex only guards the list of pools.
//!
//! A `VkDescriptorPool` must not be touched by two threads at once, so only
//! the owning thread ever calls into the driver for a pool. Sets freed from
//! another thread (typically the submission thread retiring them after a
//! fence) are queued on the pool and released by the owner at its next
//! allocation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use ash::vk;
use tracing::{debug, info, trace, warn};

use framepace_core::DescriptorPoolConfig;
use framepace_rhi::descriptor::{DescriptorCounts, DescriptorPool, DescriptorSetLayout};
use framepace_rhi::{RhiError, RhiResult, SharedDevice};

struct KindCapacity {
    kind: vk::DescriptorType,
    max: u32,
    left: AtomicU32,
}

/// One fixed-capacity descriptor pool and its remaining space.
pub struct DescriptorPoolBlock {
    /// Allocator-unique id, used in logs
    id: u64,
    pool: DescriptorPool,
    /// Thread that created the pool; the only one allowed to use it
    owner: ThreadId,
    max_sets: u32,
    sets_left: AtomicU32,
    kinds: Vec<KindCapacity>,
    /// Set once the driver rejected an allocation the counters allowed
    exhausted: AtomicBool,
    /// Sets freed by other threads, waiting for the owner
    pending_frees: Mutex<Vec<(vk::DescriptorSet, DescriptorCounts)>>,
}

fn take(counter: &AtomicU32, amount: u32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
            left.checked_sub(amount)
        })
        .is_ok()
}

fn give_back(counter: &AtomicU32, amount: u32, max: u32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
        Some(left.saturating_add(amount).min(max))
    });
}

impl DescriptorPoolBlock {
    fn new(id: u64, pool: DescriptorPool, capacity: &DescriptorCounts) -> Self {
        let max_sets = pool.max_sets();
        Self {
            id,
            pool,
            owner: thread::current().id(),
            max_sets,
            sets_left: AtomicU32::new(max_sets),
            kinds: capacity
                .iter()
                .map(|(kind, max)| KindCapacity {
                    kind,
                    max,
                    left: AtomicU32::new(max),
                })
                .collect(),
            exhausted: AtomicBool::new(false),
            pending_frees: Mutex::new(Vec::new()),
        }
    }

    /// Allocator-unique pool id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Thread that created the pool and alone may allocate from or free into
    /// it.
    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Set capacity the pool was created with.
    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Sets freed from other threads that the owner has not released yet.
    /// Their capacity is not available until it does.
    pub fn pending_frees(&self) -> usize {
        self.pending_frees.lock().unwrap().len()
    }

    fn is_owned_by_caller(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Accepts new allocations: queried from the owning thread, with set
    /// capacity left, and not rejected by the driver.
    pub fn is_usable(&self) -> bool {
        self.is_owned_by_caller()
            && self.space_left() > 0
            && !self.exhausted.load(Ordering::Acquire)
    }

    /// Whether [`Self::is_usable`] and every descriptor kind in `request`
    /// still fits.
    pub fn has_space_for(&self, request: &DescriptorCounts) -> bool {
        self.is_usable()
            && request
                .iter()
                .all(|(kind, count)| count <= self.space_left_for(kind))
    }

    /// Sets that can still be allocated.
    pub fn space_left(&self) -> u32 {
        self.sets_left.load(Ordering::Acquire)
    }

    /// Descriptors of `kind` still available; zero for kinds the pool lacks.
    pub fn space_left_for(&self, kind: vk::DescriptorType) -> u32 {
        self.kinds
            .iter()
            .find(|k| k.kind == kind)
            .map_or(0, |k| k.left.load(Ordering::Acquire))
    }

    /// Configured capacity for `kind`.
    pub fn max_for(&self, kind: vk::DescriptorType) -> u32 {
        self.kinds
            .iter()
            .find(|k| k.kind == kind)
            .map_or(0, |k| k.max)
    }

    fn reserve(&self, request: &DescriptorCounts) -> bool {
        if !take(&self.sets_left, 1) {
            return false;
        }
        let mut taken: Vec<(&KindCapacity, u32)> = Vec::new();
        for (kind, count) in request.iter() {
            match self.kinds.iter().find(|k| k.kind == kind) {
                Some(capacity) if take(&capacity.left, count) => taken.push((capacity, count)),
                _ => {
                    for (capacity, count) in taken {
                        give_back(&capacity.left, count, capacity.max);
                    }
                    give_back(&self.sets_left, 1, self.max_sets);
                    return false;
                }
            }
        }
        true
    }

    fn release(&self, request: &DescriptorCounts) {
        for (kind, count) in request.iter() {
            if let Some(capacity) = self.kinds.iter().find(|k| k.kind == kind) {
                give_back(&capacity.left, count, capacity.max);
            }
        }
        give_back(&self.sets_left, 1, self.max_sets);
    }

    /// Frees `set` in the driver and returns its capacity. Owner thread only.
    fn free_now(&self, set: vk::DescriptorSet, counts: &DescriptorCounts) {
        if let Err(e) = self.pool.free(set) {
            fatal!("Failed to free descriptor set from pool {}: {}", self.id, e);
        }
        self.release(counts);
    }

    /// Releases every set other threads queued on this pool. Owner thread
    /// only. Returns how many were released.
    fn drain_pending_frees(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_frees.lock().unwrap());
        for (set, counts) in &pending {
            self.free_now(*set, counts);
        }
        pending.len()
    }
}

impl std::fmt::Debug for DescriptorPoolBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPoolBlock")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("sets_left", &self.space_left())
            .field("max_sets", &self.max_sets)
            .field("pending_frees", &self.pending_frees())
            .finish()
    }
}

/// A descriptor set and the pool it was carved from.
///
/// Return it with [`DescriptorAllocator::free`].
#[derive(Debug)]
pub struct DescriptorHandle {
    set: vk::DescriptorSet,
    block: Arc<DescriptorPoolBlock>,
    counts: DescriptorCounts,
}

impl DescriptorHandle {
    /// The raw set, valid until the handle is freed.
    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Pool the set was allocated from.
    #[inline]
    pub fn pool(&self) -> &Arc<DescriptorPoolBlock> {
        &self.block
    }
}

fn pool_capacity(config: &DescriptorPoolConfig) -> DescriptorCounts {
    DescriptorCounts::new()
        .with(vk::DescriptorType::UNIFORM_BUFFER, config.uniform_buffers)
        .with(vk::DescriptorType::STORAGE_BUFFER, config.storage_buffers)
        .with(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            config.combined_image_samplers,
        )
        .with(vk::DescriptorType::SAMPLED_IMAGE, config.sampled_images)
        .with(vk::DescriptorType::STORAGE_IMAGE, config.storage_images)
        .with(vk::DescriptorType::SAMPLER, config.samplers)
}

fn is_pool_exhaustion(error: &RhiError) -> bool {
    matches!(
        error.vk_result(),
        Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
    )
}

/// Hands out descriptor sets, growing its pool bank on demand.
pub struct DescriptorAllocator {
    device: SharedDevice,
    max_sets: u32,
    capacity: DescriptorCounts,
    pools: Mutex<Vec<Arc<DescriptorPoolBlock>>>,
    next_id: AtomicU64,
}

impl DescriptorAllocator {
    /// Pools are created with the capacity in `config`.
    pub fn new(device: SharedDevice, config: &DescriptorPoolConfig) -> Self {
        if config.max_sets == 0 {
            fatal!("Descriptor pool configured with max_sets = 0");
        }
        Self {
            device,
            max_sets: config.max_sets,
            capacity: pool_capacity(config),
            pools: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocates one set of `layout`.
    ///
    /// A layout needing more descriptors of some kind than a whole pool holds
    /// can never be served and is fatal.
    ///
    /// # Errors
    ///
    /// Fails if a new pool cannot be created or the driver rejects the
    /// allocation from a fresh pool.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> RhiResult<DescriptorHandle> {
        self.release_pending_frees();

        let request = layout.counts();
        if !request.fits_within(&self.capacity) {
            fatal!(
                "Descriptor layout {:?} exceeds the per-pool capacity {:?}",
                request,
                self.capacity
            );
        }

        loop {
            let (block, fresh) = self.reserve_block(request)?;
            match block.pool.allocate(layout) {
                Ok(set) => {
                    return Ok(DescriptorHandle {
                        set,
                        block,
                        counts: request.clone(),
                    });
                }
                Err(e) if !fresh && is_pool_exhaustion(&e) => {
                    block.release(request);
                    block.exhausted.store(true, Ordering::Release);
                    warn!(
                        "Descriptor pool {} rejected an allocation ({}), retiring it",
                        block.id, e
                    );
                }
                Err(e) => {
                    block.release(request);
                    return Err(e);
                }
            }
        }
    }

    /// First fit among the calling thread's pools, else a new pool.
    /// Returns the block with the request already reserved.
    fn reserve_block(
        &self,
        request: &DescriptorCounts,
    ) -> RhiResult<(Arc<DescriptorPoolBlock>, bool)> {
        let mut pools = self.pools.lock().unwrap();

        let found = pools
            .iter()
            .find(|block| block.has_space_for(request) && block.reserve(request));
        if let Some(block) = found {
            return Ok((Arc::clone(block), false));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pool = DescriptorPool::new(
            self.device.clone(),
            self.max_sets,
            &self.capacity.as_pool_sizes(),
        )?;
        let block = Arc::new(DescriptorPoolBlock::new(id, pool, &self.capacity));
        if !block.reserve(request) {
            fatal!("Fresh descriptor pool {} cannot hold {:?}", id, request);
        }
        info!(
            "Created descriptor pool {} for thread {:?} ({} pool(s) total)",
            id,
            block.owner,
            pools.len() + 1
        );
        pools.push(Arc::clone(&block));
        Ok((block, true))
    }

    /// Returns the set and its capacity to the owning pool.
    ///
    /// On the owning thread the set is freed immediately. From any other
    /// thread it is queued on the pool, and the owner frees it at its next
    /// [`Self::allocate`] or [`Self::release_pending_frees`].
    ///
    /// A driver failure while freeing is fatal.
    pub fn free(&self, handle: DescriptorHandle) {
        let DescriptorHandle { set, block, counts } = handle;
        if block.is_owned_by_caller() {
            block.free_now(set, &counts);
            debug!("Freed descriptor set into pool {}", block.id);
        } else {
            block.pending_frees.lock().unwrap().push((set, counts));
            debug!(
                "Queued descriptor set for pool {} owned by {:?}",
                block.id, block.owner
            );
        }
    }

    /// Frees the sets other threads returned to the calling thread's pools.
    ///
    /// # Returns
    ///
    /// The number of sets released.
    pub fn release_pending_frees(&self) -> usize {
        let owned: Vec<Arc<DescriptorPoolBlock>> = self
            .pools
            .lock()
            .unwrap()
            .iter()
            .filter(|block| block.is_owned_by_caller())
            .cloned()
            .collect();
        let released: usize = owned.iter().map(|block| block.drain_pending_frees()).sum();
        if released > 0 {
            trace!("Released {} descriptor set(s) freed by other threads", released);
        }
        released
    }

    /// Number of pools created so far, across all threads.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    /// Snapshot of every pool, in creation order.
    pub fn pools(&self) -> Vec<Arc<DescriptorPoolBlock>> {
        self.pools.lock().unwrap().clone()
    }

    /// Per-pool capacity.
    #[inline]
    pub fn capacity(&self) -> &DescriptorCounts {
        &self.capacity
    }

    /// Drops every pool.
    ///
    /// A pool with outstanding handles is destroyed once its last handle is
    /// dropped.
    pub fn destroy_pools(&self) {
        let mut pools = self.pools.lock().unwrap();
        let outstanding = pools
            .iter()
            .filter(|block| block.space_left() < block.max_sets)
            .count();
        if outstanding > 0 {
            warn!(
                "Destroying descriptor pools with {} pool(s) still holding sets",
                outstanding
            );
        }
        let count = pools.len();
        pools.clear();
        if count > 0 {
            info!("Destroyed {} descriptor pool(s)", count);
        }
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        self.destroy_pools();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepace_rhi::descriptor::DescriptorBindingBuilder;
    use framepace_rhi::headless::HeadlessDevice;

    fn small_config() -> DescriptorPoolConfig {
        DescriptorPoolConfig {
            max_sets: 2,
            uniform_buffers: 4,
            storage_buffers: 0,
            combined_image_samplers: 2,
            sampled_images: 0,
            storage_images: 0,
            samplers: 0,
        }
    }

    fn ubo_layout(device: &SharedDevice, count: u32) -> DescriptorSetLayout {
        let binding = DescriptorBindingBuilder::binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            count,
            vk::ShaderStageFlags::VERTEX,
        );
        DescriptorSetLayout::new(device.clone(), &[binding]).unwrap()
    }

    #[test]
    fn test_first_pool_serves_until_full() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorAllocator::new(device.clone(), &small_config());
        let layout = ubo_layout(&device, 1);

        let a = allocator.allocate(&layout).unwrap();
        let b = allocator.allocate(&layout).unwrap();
        assert_eq!(allocator.pool_count(), 1);
        assert_eq!(a.pool().id(), b.pool().id());
        assert_eq!(a.pool().space_left(), 0);
        assert!(!a.pool().is_usable());

        let c = allocator.allocate(&layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);
        assert_ne!(c.pool().id(), a.pool().id());
    }

    #[test]
    fn test_free_returns_capacity() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorAllocator::new(device.clone(), &small_config());
        let layout = ubo_layout(&device, 3);

        let handle = allocator.allocate(&layout).unwrap();
        let pool = Arc::clone(handle.pool());
        assert_eq!(pool.space_left_for(vk::DescriptorType::UNIFORM_BUFFER), 1);

        allocator.free(handle);
        assert_eq!(pool.space_left(), 2);
        assert_eq!(pool.space_left_for(vk::DescriptorType::UNIFORM_BUFFER), 4);
    }

    #[test]
    fn test_kind_exhaustion_opens_new_pool() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorAllocator::new(device.clone(), &small_config());
        let layout = ubo_layout(&device, 3);

        let first = allocator.allocate(&layout).unwrap();
        // One set slot remains but only one uniform buffer.
        let second = allocator.allocate(&layout).unwrap();

        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(first.pool().space_left(), 1);
        assert_ne!(first.pool().id(), second.pool().id());
    }

    #[test]
    fn test_pools_are_thread_affine() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = Arc::new(DescriptorAllocator::new(device.clone(), &small_config()));
        let layout = Arc::new(ubo_layout(&device, 1));

        let main = allocator.allocate(&layout).unwrap();

        let worker_pool = {
            let allocator = Arc::clone(&allocator);
            let layout = Arc::clone(&layout);
            thread::spawn(move || {
                let handle = allocator.allocate(&layout).unwrap();
                let id = handle.pool().id();
                allocator.free(handle);
                id
            })
            .join()
            .unwrap()
        };

        assert_ne!(worker_pool, main.pool().id());
        assert!(main.pool().is_usable());
        assert_eq!(allocator.pool_count(), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds the per-pool capacity")]
    fn test_request_larger_than_pool_is_fatal() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorAllocator::new(device.clone(), &small_config());
        let layout = ubo_layout(&device, 5);
        let _ = allocator.allocate(&layout);
    }

    #[test]
    fn test_destroy_pools_releases_device_pools() {
        let headless = Arc::new(HeadlessDevice::new());
        let device: SharedDevice = headless.clone();
        let allocator = DescriptorAllocator::new(device.clone(), &small_config());
        let layout = ubo_layout(&device, 1);

        let handle = allocator.allocate(&layout).unwrap();
        allocator.free(handle);
        assert_eq!(headless.live_descriptor_pools(), 1);

        allocator.destroy_pools();
        assert_eq!(headless.live_descriptor_pools(), 0);
    }

    #[test]
    fn test_foreign_free_waits_for_owner() {
        let headless = Arc::new(HeadlessDevice::new());
        let device: SharedDevice = headless.clone();
        let allocator = Arc::new(DescriptorAllocator::new(device.clone(), &small_config()));
        let layout = Arc::new(ubo_layout(&device, 1));

        let (to_main, from_worker) = std::sync::mpsc::channel();
        let (to_worker, from_main) = std::sync::mpsc::channel::<()>();
        let worker = {
            let allocator = Arc::clone(&allocator);
            let layout = Arc::clone(&layout);
            thread::spawn(move || {
                let handle = allocator.allocate(&layout).unwrap();
                let pool = Arc::clone(handle.pool());
                to_main.send(handle).unwrap();
                from_main.recv().unwrap();

                // Owner's next allocation releases the queued set first.
                let next = allocator.allocate(&layout).unwrap();
                assert_eq!(next.pool().id(), pool.id());
                assert_eq!(pool.pending_frees(), 0);
                assert_eq!(pool.space_left(), 1);
                allocator.free(next);
            })
        };

        let handle = from_worker.recv().unwrap();
        let pool = Arc::clone(handle.pool());
        allocator.free(handle);
        assert_eq!(pool.pending_frees(), 1);
        assert_eq!(pool.space_left(), 1);
        assert_eq!(headless.live_descriptor_sets(), 1);

        to_worker.send(()).unwrap();
        worker.join().unwrap();
        assert_eq!(headless.live_descriptor_sets(), 0);
        assert_eq!(pool.space_left(), 2);
    }

    #[test]
    fn test_release_pending_frees_only_touches_own_pools() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = Arc::new(DescriptorAllocator::new(device.clone(), &small_config()));
        let layout = Arc::new(ubo_layout(&device, 1));

        let handle = {
            let allocator = Arc::clone(&allocator);
            let layout = Arc::clone(&layout);
            thread::spawn(move || allocator.allocate(&layout).unwrap())
                .join()
                .unwrap()
        };
        let pool = Arc::clone(handle.pool());
        allocator.free(handle);

        assert_eq!(allocator.release_pending_frees(), 0);
        assert_eq!(pool.pending_frees(), 1);
    }

    #[test]
    #[should_panic(expected = "Failed to free descriptor set")]
    fn test_driver_free_failure_is_fatal() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorAllocator::new(device.clone(), &small_config());
        let layout = ubo_layout(&device, 1);

        let handle = allocator.allocate(&layout).unwrap();
        handle.block.pool.free(handle.set).unwrap();
        allocator.free(handle);
    }
}
