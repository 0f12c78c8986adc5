#![allow(dead_code)]

use std::sync::Arc;

use framepace_core::RenderConfig;
use framepace_renderer::RenderContext;
use framepace_rhi::headless::HeadlessDevice;
use framepace_rhi::{AttachmentDesc, vk};

pub const SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

/// Installs a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn context_with(config: RenderConfig) -> (Arc<HeadlessDevice>, RenderContext) {
    init_tracing();
    let device = Arc::new(HeadlessDevice::new());
    let surface = device.create_surface();
    let context = RenderContext::new(device.clone(), surface, 800, 600, &config)
        .expect("Failed to create headless render context");
    (device, context)
}

pub fn context(frames_in_flight: usize) -> (Arc<HeadlessDevice>, RenderContext) {
    context_with(RenderConfig {
        frames_in_flight,
        ..Default::default()
    })
}

pub fn backbuffer() -> Vec<AttachmentDesc> {
    vec![AttachmentDesc::color("backbuffer", SURFACE_FORMAT, [0.0, 0.0, 0.0, 1.0])]
}
