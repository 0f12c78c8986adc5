//! Per-frame replication of GPU-facing values.
//!
//! A [`PerFrame`] holds one value per slot of a replication domain. The
//! domain is part of the type: [`InFlight`] containers are sized by the
//! number of frames that may execute concurrently on the GPU, while
//! [`Presentable`] containers are sized by the swapchain image count. Mixing
//! the two is a type error rather than an off-by-one at runtime.
//!
//! Sizes are captured when the container is created or recreated and stay
//! fixed until the next explicit [`PerFrame::recreate`], even if the shared
//! [`FrameCounts`] change in the meantime.
//!
//! # Example
//!
//! ```
//! use framepace_renderer::per_frame::{FrameCounts, InFlight, PerFrame};
//!
//! let counts = FrameCounts::new(2, 3);
//! let mut uniforms: PerFrame<[f32; 4], InFlight> = PerFrame::new(&counts, |_| [0.0; 4]);
//! assert_eq!(uniforms.max_instance_count(), 2);
//!
//! uniforms.current_mut()[0] = 1.0;
//! assert_eq!(uniforms[0][0], 1.0);
//! ```

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Replication counts and current indices shared by one render context.
///
/// The frame scheduler is the only writer during normal operation.
#[derive(Debug)]
pub struct FrameCounts {
    /// Presentable images in the current swapchain
    image_count: AtomicUsize,
    /// Frames the CPU may run ahead of the GPU
    frames_in_flight: AtomicUsize,
    /// In-flight slot of the frame being recorded
    current_frame: AtomicUsize,
    /// Swapchain image of the frame being recorded
    current_image: AtomicUsize,
}

impl FrameCounts {
    /// Creates shared counts with both current indices at zero.
    ///
    /// # Arguments
    ///
    /// * `frames_in_flight` - Size of the [`InFlight`] domain
    /// * `image_count` - Size of the [`Presentable`] domain; zero until the
    ///   first swapchain exists
    pub fn new(frames_in_flight: usize, image_count: usize) -> Arc<Self> {
        Arc::new(Self {
            image_count: AtomicUsize::new(image_count),
            frames_in_flight: AtomicUsize::new(frames_in_flight),
            current_frame: AtomicUsize::new(0),
            current_image: AtomicUsize::new(0),
        })
    }

    /// Number of presentable images in the current swapchain.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.image_count.load(Ordering::Acquire)
    }

    /// Number of frames that may execute concurrently on the GPU.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.load(Ordering::Acquire)
    }

    /// In-flight slot being recorded.
    #[inline]
    pub fn current_frame(&self) -> usize {
        self.current_frame.load(Ordering::Acquire)
    }

    /// Swapchain image acquired for the frame being recorded.
    #[inline]
    pub fn current_image(&self) -> usize {
        self.current_image.load(Ordering::Acquire)
    }

    /// Records the image count of a rebuilt swapchain. Existing
    /// [`Presentable`] containers keep their size until recreated.
    pub fn set_image_count(&self, count: usize) {
        self.image_count.store(count, Ordering::Release);
    }

    /// Moves [`InFlight`] `current()` lookups to slot `frame`.
    pub fn set_current_frame(&self, frame: usize) {
        self.current_frame.store(frame, Ordering::Release);
    }

    /// Moves [`Presentable`] `current()` lookups to image `image`.
    pub fn set_current_image(&self, image: usize) {
        self.current_image.store(image, Ordering::Release);
    }
}

/// A replication domain.
pub trait Replication: 'static {
    /// Name used in diagnostics.
    const NAME: &'static str;

    /// Number of slots the domain currently asks for.
    fn count(counts: &FrameCounts) -> usize;

    /// Slot in use by the frame being recorded.
    fn current(counts: &FrameCounts) -> usize;
}

/// One slot per frame in flight.
pub enum InFlight {}

/// One slot per presentable swapchain image.
pub enum Presentable {}

impl Replication for InFlight {
    const NAME: &'static str = "in-flight";

    fn count(counts: &FrameCounts) -> usize {
        counts.frames_in_flight()
    }

    fn current(counts: &FrameCounts) -> usize {
        counts.current_frame()
    }
}

impl Replication for Presentable {
    const NAME: &'static str = "presentable";

    fn count(counts: &FrameCounts) -> usize {
        counts.image_count()
    }

    fn current(counts: &FrameCounts) -> usize {
        counts.current_image()
    }
}

/// A value replicated once per slot of domain `D`.
///
/// Static containers hold a single value that every index resolves to.
pub struct PerFrame<T, D: Replication> {
    /// One value per slot, or exactly one when static
    values: Vec<T>,
    is_static: bool,
    /// Source of the domain count and the current index
    counts: Arc<FrameCounts>,
    _domain: PhantomData<fn() -> D>,
}

impl<T, D: Replication> PerFrame<T, D> {
    /// Creates one value per slot, sized to the domain's current count.
    ///
    /// # Arguments
    ///
    /// * `counts` - Shared counts of the render context
    /// * `init` - Called with each slot index in order
    pub fn new(counts: &Arc<FrameCounts>, init: impl FnMut(usize) -> T) -> Self {
        let values = (0..D::count(counts)).map(init).collect();
        Self::from_values(counts, values, false)
    }

    /// Like [`PerFrame::new`], stopping at the first failed slot.
    ///
    /// # Errors
    ///
    /// Returns the first error `init` produced; values built before it are
    /// dropped.
    pub fn try_new<E>(
        counts: &Arc<FrameCounts>,
        init: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<Self, E> {
        let values = (0..D::count(counts)).map(init).collect::<Result<_, _>>()?;
        Ok(Self::from_values(counts, values, false))
    }

    /// A single instance shared by every slot.
    pub fn new_static(counts: &Arc<FrameCounts>, value: T) -> Self {
        Self::from_values(counts, vec![value], true)
    }

    fn from_values(counts: &Arc<FrameCounts>, values: Vec<T>, is_static: bool) -> Self {
        Self {
            values,
            is_static,
            counts: Arc::clone(counts),
            _domain: PhantomData,
        }
    }

    /// Slot count captured at the last (re)creation.
    #[inline]
    pub fn max_instance_count(&self) -> usize {
        self.values.len()
    }

    /// Whether every index resolves to one shared instance.
    #[inline]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    fn slot(&self, index: usize) -> usize {
        if self.is_static {
            return 0;
        }
        if index >= self.values.len() {
            fatal!(
                "{} PerFrame index {} out of bounds (instance count {})",
                D::NAME,
                index,
                self.values.len()
            );
        }
        index
    }

    /// Value of slot `index`. A static container returns its single
    /// instance for any index.
    ///
    /// # Panics
    ///
    /// Fatal if `index` is not below [`Self::max_instance_count`].
    pub fn get(&self, index: usize) -> &T {
        &self.values[self.slot(index)]
    }

    /// Mutable form of [`Self::get`], with the same bounds check.
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        let slot = self.slot(index);
        &mut self.values[slot]
    }

    /// Index of the current frame or image in this container's domain.
    #[inline]
    pub fn current_index(&self) -> usize {
        D::current(&self.counts)
    }

    /// Value of the frame or image being recorded.
    ///
    /// # Panics
    ///
    /// Fatal if the current index is beyond the count captured at the last
    /// (re)creation.
    pub fn current(&self) -> &T {
        self.get(self.current_index())
    }

    /// Mutable form of [`Self::current`].
    pub fn current_mut(&mut self) -> &mut T {
        let index = self.current_index();
        self.get_mut(index)
    }

    /// Rebuilds the slots at the domain's current count and returns the old
    /// values so the caller decides when they are destroyed.
    ///
    /// A static container re-initializes its single instance.
    pub fn recreate(&mut self, init: impl FnMut(usize) -> T) -> Vec<T> {
        let count = if self.is_static { 1 } else { D::count(&self.counts) };
        let values = (0..count).map(init).collect();
        std::mem::replace(&mut self.values, values)
    }

    /// Like [`PerFrame::recreate`]; on failure the container keeps its old
    /// values.
    ///
    /// # Errors
    ///
    /// Returns the first error `init` produced.
    pub fn try_recreate<E>(
        &mut self,
        init: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<Vec<T>, E> {
        let count = if self.is_static { 1 } else { D::count(&self.counts) };
        let values = (0..count).map(init).collect::<Result<_, _>>()?;
        Ok(std::mem::replace(&mut self.values, values))
    }

    /// Every instance in slot order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.values.iter()
    }

    /// Every instance in slot order, mutably.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.values.iter_mut()
    }

    /// Counts this container reads its size and current index from.
    #[inline]
    pub fn counts(&self) -> &Arc<FrameCounts> {
        &self.counts
    }
}

impl<T, D: Replication> Index<usize> for PerFrame<T, D> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.get(index)
    }
}

impl<T, D: Replication> IndexMut<usize> for PerFrame<T, D> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.get_mut(index)
    }
}

impl<T: Clone, D: Replication> Clone for PerFrame<T, D> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            is_static: self.is_static,
            counts: Arc::clone(&self.counts),
            _domain: PhantomData,
        }
    }
}

impl<T: std::fmt::Debug, D: Replication> std::fmt::Debug for PerFrame<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerFrame")
            .field("domain", &D::NAME)
            .field("is_static", &self.is_static)
            .field("values", &self.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domains_use_their_own_count() {
        let counts = FrameCounts::new(2, 3);
        let slots: PerFrame<u32, InFlight> = PerFrame::new(&counts, |i| i as u32);
        let images: PerFrame<u32, Presentable> = PerFrame::new(&counts, |i| i as u32);

        assert_eq!(slots.max_instance_count(), 2);
        assert_eq!(images.max_instance_count(), 3);
        assert_eq!(images[2], 2);
    }

    #[test]
    fn test_current_follows_counts() {
        let counts = FrameCounts::new(2, 3);
        let images: PerFrame<usize, Presentable> = PerFrame::new(&counts, |i| i * 10);

        counts.set_current_image(2);
        assert_eq!(*images.current(), 20);
        counts.set_current_frame(1);
        assert_eq!(images.current_index(), 2);
    }

    #[test]
    fn test_recreate_returns_old_values() {
        let counts = FrameCounts::new(2, 2);
        let mut images: PerFrame<String, Presentable> =
            PerFrame::new(&counts, |i| format!("old{i}"));

        counts.set_image_count(4);
        let old = images.recreate(|i| format!("new{i}"));

        assert_eq!(old, vec!["old0".to_string(), "old1".to_string()]);
        assert_eq!(images.max_instance_count(), 4);
        assert_eq!(images[3], "new3");
    }

    #[test]
    fn test_try_recreate_keeps_values_on_failure() {
        let counts = FrameCounts::new(2, 2);
        let mut slots: PerFrame<u32, InFlight> = PerFrame::new(&counts, |_| 7);

        let result: Result<Vec<u32>, &str> =
            slots.try_recreate(|i| if i == 1 { Err("boom") } else { Ok(0) });

        assert!(result.is_err());
        assert_eq!(slots[1], 7);
    }

    #[test]
    fn test_static_ignores_index() {
        let counts = FrameCounts::new(3, 3);
        let mut shared: PerFrame<u32, InFlight> = PerFrame::new_static(&counts, 5);

        assert!(shared.is_static());
        assert_eq!(shared.max_instance_count(), 1);
        shared[2] = 9;
        assert_eq!(shared[0], 9);
        assert_eq!(shared[100], 9);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_index_past_count_is_fatal() {
        let counts = FrameCounts::new(2, 3);
        let slots: PerFrame<u32, InFlight> = PerFrame::new(&counts, |_| 0);
        let _ = slots[2];
    }

    #[test]
    fn test_clone_is_deep() {
        let counts = FrameCounts::new(2, 3);
        let original: PerFrame<Vec<u8>, InFlight> = PerFrame::new(&counts, |_| vec![1]);
        let mut copy = original.clone();

        copy[0].push(2);
        assert_eq!(original[0], vec![1]);
        assert_eq!(copy.max_instance_count(), original.max_instance_count());
    }

    #[test]
    fn test_per_frame_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PerFrame<u32, InFlight>>();
        assert_send_sync::<PerFrame<u32, Presentable>>();
    }
}
