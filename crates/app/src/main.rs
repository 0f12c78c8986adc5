//! framepace demo: clears a window every frame through the frame scheduler.
//!
//! Usage: `framepace-demo [config.json]`. `RUST_LOG` controls log output.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use framepace_core::{FrameTimer, RenderConfig};
use framepace_platform::{Surface, Window};
use framepace_renderer::RenderContext;
use framepace_rhi::device::Device;
use framepace_rhi::instance::Instance;
use framepace_rhi::physical_device::select_physical_device;
use framepace_rhi::{AttachmentDesc, vk};

const CLEAR_COLOR: [f32; 4] = [0.05, 0.07, 0.12, 1.0];

/// Everything that lives as long as the window. Fields drop top to bottom:
/// the context releases its swapchain before the surface and instance go.
struct Renderer {
    context: RenderContext,
    _device: Arc<Device>,
    _surface: Surface,
    _instance: Instance,
    window: Window,
}

impl Renderer {
    fn new(event_loop: &ActiveEventLoop, config: &RenderConfig) -> Result<Self> {
        let window = Window::new(event_loop, "framepace", 1280, 720)?;
        let instance = Instance::new(c"framepace-demo", config.enable_validation)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;
        let physical_device =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &physical_device)?;

        let (width, height) = window.size();
        let mut context =
            RenderContext::new(device.clone(), surface.handle(), width, height, config)
                .context("Failed to create render context")?;

        let format = context
            .scheduler()
            .swapchain()
            .map(|swapchain| swapchain.format())
            .unwrap_or(vk::Format::B8G8R8A8_SRGB);
        context.declare_render_pass(
            "present",
            vec![AttachmentDesc::color("backbuffer", format, CLEAR_COLOR)],
            true,
        );

        Ok(Self {
            context,
            _device: device,
            _surface: surface,
            _instance: instance,
            window,
        })
    }
}

struct App {
    config: RenderConfig,
    renderer: Option<Renderer>,
    timer: FrameTimer,
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        match Renderer::new(event_loop, &self.config) {
            Ok(renderer) => {
                info!("Initialization complete, entering main loop");
                self.renderer = Some(renderer);
            }
            Err(e) => {
                error!("Failed to initialize: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                if let Err(e) = renderer.context.wait_idle() {
                    error!("Device lost during shutdown: {}", e);
                }
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if renderer.window.set_size(size) {
                    renderer.context.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if renderer.context.draw_frame()
                    && let (_, Some(fps)) = self.timer.frame()
                {
                    info!(
                        "{:.1} fps ({}x{})",
                        fps,
                        renderer.context.extent().width,
                        renderer.context.extent().height
                    );
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = &self.renderer {
            renderer.window.request_redraw();
        }
    }
}

fn load_config() -> Result<RenderConfig> {
    match std::env::args().nth(1) {
        Some(path) => RenderConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path)),
        None => Ok(RenderConfig::default()),
    }
}

fn main() -> Result<()> {
    framepace_core::init_logging();
    info!("Starting framepace demo");

    let config = load_config()?;
    config.validate()?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App {
        config,
        renderer: None,
        timer: FrameTimer::default(),
    };
    event_loop.run_app(&mut app)?;

    Ok(())
}
