//! Descriptor layouts, per-kind counts and pools.
//!
//! - [`DescriptorCounts`] tallies descriptors per [`vk::DescriptorType`]
//! - [`DescriptorSetLayout`] remembers the counts a set of its layout consumes
//! - [`DescriptorPool`] is a fixed-capacity pool allowing individual frees
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use framepace_rhi::descriptor::{DescriptorBindingBuilder, DescriptorPool, DescriptorSetLayout};
//!
//! # fn example(device: framepace_rhi::SharedDevice) -> framepace_rhi::RhiResult<()> {
//! let layout = DescriptorSetLayout::new(
//!     device.clone(),
//!     &[DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX)],
//! )?;
//!
//! let pool = DescriptorPool::new(device.clone(), 16, &layout.counts().to_pool_sizes(16))?;
//! let set = pool.allocate(&layout)?;
//! pool.free(set)?;
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::debug;

use crate::backend::SharedDevice;
use crate::error::RhiResult;

/// Number of descriptors needed or available, per descriptor kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorCounts {
    counts: Vec<(vk::DescriptorType, u32)>,
}

impl DescriptorCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sums the descriptor counts of each binding by kind.
    pub fn from_bindings(bindings: &[vk::DescriptorSetLayoutBinding<'_>]) -> Self {
        bindings
            .iter()
            .fold(Self::new(), |counts, binding| {
                counts.with(binding.descriptor_type, binding.descriptor_count)
            })
    }

    /// Adds `count` descriptors of `kind`.
    pub fn with(mut self, kind: vk::DescriptorType, count: u32) -> Self {
        if count == 0 {
            return self;
        }
        match self.counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, existing)) => *existing += count,
            None => self.counts.push((kind, count)),
        }
        self
    }

    /// Count for one kind, zero when absent.
    pub fn get(&self, kind: vk::DescriptorType) -> u32 {
        self.counts
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |&(_, count)| count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (vk::DescriptorType, u32)> + '_ {
        self.counts.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// True when every kind in `self` is covered by `capacity`.
    pub fn fits_within(&self, capacity: &DescriptorCounts) -> bool {
        self.iter().all(|(kind, count)| count <= capacity.get(kind))
    }

    /// Pool sizes for a pool holding `sets` sets of this shape.
    pub fn to_pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.iter()
            .map(|(kind, count)| {
                vk::DescriptorPoolSize::default()
                    .ty(kind)
                    .descriptor_count(count.saturating_mul(sets))
            })
            .collect()
    }

    /// Pool sizes taking the counts as totals.
    pub fn as_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.to_pool_sizes(1)
    }
}

/// RAII descriptor set layout that remembers its per-kind counts.
pub struct DescriptorSetLayout {
    device: SharedDevice,
    layout: vk::DescriptorSetLayout,
    counts: DescriptorCounts,
}

impl DescriptorSetLayout {
    pub fn new(
        device: SharedDevice,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<Self> {
        let layout = device.create_descriptor_set_layout(bindings)?;
        let counts = DescriptorCounts::from_bindings(bindings);
        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );
        Ok(Self {
            device,
            layout,
            counts,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Descriptors one set of this layout consumes.
    #[inline]
    pub fn counts(&self) -> &DescriptorCounts {
        &self.counts
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
    }
}

/// RAII descriptor pool created with `FREE_DESCRIPTOR_SET`.
pub struct DescriptorPool {
    device: SharedDevice,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    pub fn new(
        device: SharedDevice,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<Self> {
        let pool = device.create_descriptor_pool(max_sets, pool_sizes)?;
        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            max_sets,
            pool_sizes.len()
        );
        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Allocates one set of `layout`.
    ///
    /// # Errors
    ///
    /// `ERROR_OUT_OF_POOL_MEMORY` or `ERROR_FRAGMENTED_POOL` when the pool
    /// cannot serve the request.
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        self.device
            .allocate_descriptor_set(self.pool, layout.handle())
    }

    pub fn free(&self, set: vk::DescriptorSet) -> RhiResult<()> {
        self.device.free_descriptor_set(self.pool, set)
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
        debug!("Destroyed descriptor pool (max_sets={})", self.max_sets);
    }
}

/// Shorthands for single-descriptor layout bindings.
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    /// A binding of `count` descriptors of `kind`.
    #[inline]
    pub fn binding(
        binding: u32,
        kind: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(kind)
            .descriptor_count(count)
            .stage_flags(stage_flags)
    }

    #[inline]
    pub fn uniform_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    #[inline]
    pub fn storage_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    #[inline]
    pub fn combined_image_sampler(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    #[inline]
    pub fn storage_image(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_counts_sum_by_kind() {
        let bindings = [
            DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
            DescriptorBindingBuilder::binding(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                4,
                vk::ShaderStageFlags::FRAGMENT,
            ),
            DescriptorBindingBuilder::uniform_buffer(2, vk::ShaderStageFlags::FRAGMENT),
        ];
        let counts = DescriptorCounts::from_bindings(&bindings);
        assert_eq!(counts.get(vk::DescriptorType::UNIFORM_BUFFER), 2);
        assert_eq!(counts.get(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 4);
        assert_eq!(counts.get(vk::DescriptorType::STORAGE_IMAGE), 0);
    }

    #[test]
    fn test_fits_within() {
        let capacity = DescriptorCounts::new()
            .with(vk::DescriptorType::UNIFORM_BUFFER, 4)
            .with(vk::DescriptorType::SAMPLER, 1);
        let small = DescriptorCounts::new().with(vk::DescriptorType::UNIFORM_BUFFER, 4);
        let missing_kind = DescriptorCounts::new().with(vk::DescriptorType::STORAGE_BUFFER, 1);

        assert!(small.fits_within(&capacity));
        assert!(!missing_kind.fits_within(&capacity));
        assert!(DescriptorCounts::new().fits_within(&capacity));
    }

    #[test]
    fn test_pool_sizes_scale_with_sets() {
        let counts = DescriptorCounts::new().with(vk::DescriptorType::UNIFORM_BUFFER, 2);
        let sizes = counts.to_pool_sizes(8);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 16);
    }

    #[test]
    fn test_pool_exhaustion_reports_out_of_pool_memory() {
        let device: SharedDevice = Arc::new(HeadlessDevice::new());
        let layout = DescriptorSetLayout::new(
            device.clone(),
            &[DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX)],
        )
        .unwrap();
        let pool = DescriptorPool::new(device, 1, &layout.counts().to_pool_sizes(1)).unwrap();

        let set = pool.allocate(&layout).unwrap();
        let err = pool.allocate(&layout).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY));

        pool.free(set).unwrap();
        assert!(pool.allocate(&layout).is_ok());
    }

    #[test]
    fn test_binding_builder() {
        let binding = DescriptorBindingBuilder::storage_image(3, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(binding.binding, 3);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(binding.descriptor_count, 1);
    }
}
