//! Frame pacing and GPU resource lifetime.
//!
//! This crate drives the per-frame loop on top of `framepace_rhi`:
//! - Per-frame replication of resources ([`per_frame`])
//! - Per-thread command pools and one-shot submissions
//! - Descriptor set allocation from a growing bank of pools
//! - Acquire, submit and present with surface rebuilds
//! - A render-pass graph recorded into each frame
//!
//! [`RenderContext`] ties them together for one surface.

#[macro_use]
mod fatal;

pub mod command_pools;
pub mod context;
pub mod descriptor_allocator;
pub mod frame_scheduler;
pub mod per_frame;
pub mod render_graph;
pub mod retire;

pub use context::{RenderContext, SurfaceListener};
pub use descriptor_allocator::{DescriptorAllocator, DescriptorHandle};
pub use frame_scheduler::{FrameHandle, FrameScheduler, SurfaceRecreated};
pub use per_frame::{FrameCounts, InFlight, PerFrame, Presentable};
pub use render_graph::{PassId, PassRecorder, RenderGraph};
