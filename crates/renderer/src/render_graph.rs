//! Render-pass graph.
//!
//! Passes are declared once by unique name and linked parent to child. A
//! child renders before its parents and leaves its attachments in
//! `SHADER_READ_ONLY_OPTIMAL` so they can sample them; a present pass writes
//! its first color attachment straight into the swapchain image and leaves
//! it in `PRESENT_SRC_KHR`.
//!
//! Every pass owns one framebuffer per presentable image. Attachments other
//! than the swapchain image are device-local images held in a
//! generation-checked arena and rebuilt when the surface changes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framepace_renderer::per_frame::FrameCounts;
//! use framepace_renderer::render_graph::RenderGraph;
//! use framepace_rhi::headless::HeadlessDevice;
//! use framepace_rhi::{AttachmentDesc, vk};
//!
//! let counts = FrameCounts::new(2, 3);
//! let mut graph = RenderGraph::new(Arc::new(HeadlessDevice::new()), counts);
//!
//! let shadow = graph.declare(
//!     "shadow",
//!     vec![AttachmentDesc::depth("shadow_depth", vk::Format::D32_SFLOAT)],
//!     false,
//! );
//! let main = graph.declare(
//!     "main",
//!     vec![AttachmentDesc::color("backbuffer", vk::Format::B8G8R8A8_SRGB, [0.0; 4])],
//!     true,
//! );
//! graph.add_child(main, shadow);
//! assert_eq!(graph.find("shadow"), Some(shadow));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use framepace_rhi::arena::{Handle, ResourceArena};
use framepace_rhi::backend::aspect_for_format;
use framepace_rhi::command::CommandBuffer;
use framepace_rhi::{
    AttachmentDesc, AttachmentImage, RenderTarget, RhiResult, SharedDevice, TargetAttachment,
};

use crate::frame_scheduler::{FrameHandle, SurfaceRecreated};
use crate::per_frame::{FrameCounts, PerFrame, Presentable};

/// Identity of a declared render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u32);

impl PassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a draw callback records into.
pub struct PassRecorder<'a> {
    /// Pass being recorded
    pub pass: PassId,
    /// Name the pass was declared with
    pub name: &'a str,
    /// Frame command buffer, already inside the pass's rendering scope
    pub command_buffer: &'a CommandBuffer,
    /// Render area
    pub extent: vk::Extent2D,
    /// Swapchain image this frame presents
    pub image_index: u32,
    /// In-flight slot of this frame
    pub frame_id: usize,
}

/// Records a pass's draw commands inside its rendering scope.
pub type DrawCallback = Box<dyn FnMut(&PassRecorder<'_>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttachmentSource {
    Swapchain,
    Owned(Handle<AttachmentImage>),
}

#[derive(Clone, Copy, Debug)]
struct FramebufferAttachment {
    source: AttachmentSource,
    image: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    layout: vk::ImageLayout,
}

/// Attachments one pass renders into for one presentable image.
#[derive(Clone, Debug, Default)]
pub struct Framebuffer {
    extent: vk::Extent2D,
    /// In declaration order of the pass's attachments
    attachments: Vec<FramebufferAttachment>,
}

impl Framebuffer {
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image views in attachment order.
    pub fn views(&self) -> Vec<vk::ImageView> {
        self.attachments.iter().map(|a| a.view).collect()
    }

    /// Images in attachment order. A present pass's first entry is the
    /// swapchain image.
    pub fn images(&self) -> Vec<vk::Image> {
        self.attachments.iter().map(|a| a.image).collect()
    }

    /// Current layout of attachment `index`.
    pub fn layout(&self, index: usize) -> Option<vk::ImageLayout> {
        self.attachments.get(index).map(|a| a.layout)
    }
}

struct PassNode {
    name: String,
    attachments: Vec<AttachmentDesc>,
    is_present: bool,
    parents: Vec<PassId>,
    children: Vec<PassId>,
    framebuffers: PerFrame<Framebuffer, Presentable>,
    on_draw: Option<DrawCallback>,
    visited: bool,
}

/// DAG of render passes recorded into each frame's command buffer.
pub struct RenderGraph {
    device: SharedDevice,
    counts: Arc<FrameCounts>,
    nodes: Vec<PassNode>,
    by_name: HashMap<String, PassId>,
    /// Owned attachment images of every pass
    images: ResourceArena<AttachmentImage>,
    /// Last rebuild delivered; `None` until the first swapchain
    surface: Option<SurfaceRecreated>,
}

impl RenderGraph {
    /// Creates an empty graph. Passes get framebuffers once a surface
    /// rebuild is delivered.
    pub fn new(device: SharedDevice, counts: Arc<FrameCounts>) -> Self {
        Self {
            device,
            counts,
            nodes: Vec::new(),
            by_name: HashMap::new(),
            images: ResourceArena::new(),
            surface: None,
        }
    }

    // ========================================================================== //
    // Declaration
    // ========================================================================== //

    /// Declares a pass writing `attachments`.
    ///
    /// A present pass renders its first color attachment into the swapchain
    /// image.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique pass name
    /// * `attachments` - Images the pass renders into, in binding order
    /// * `is_present` - Whether the pass writes the swapchain image
    ///
    /// # Panics
    ///
    /// Fatal if `name` is already declared, or if a present pass has no
    /// color attachment.
    pub fn declare(
        &mut self,
        name: &str,
        attachments: Vec<AttachmentDesc>,
        is_present: bool,
    ) -> PassId {
        if self.by_name.contains_key(name) {
            fatal!("Render pass '{}' declared twice", name);
        }
        if is_present && attachments.iter().all(AttachmentDesc::is_depth) {
            fatal!("Present pass '{}' has no color attachment", name);
        }

        let id = PassId(self.nodes.len() as u32);
        self.nodes.push(PassNode {
            name: name.to_string(),
            attachments,
            is_present,
            parents: Vec::new(),
            children: Vec::new(),
            framebuffers: PerFrame::new(&self.counts, |_| Framebuffer::default()),
            on_draw: None,
            visited: false,
        });
        self.by_name.insert(name.to_string(), id);

        if let Err(e) = self.rebuild_framebuffers(id) {
            fatal!("Failed to create attachments for pass '{}': {}", name, e);
        }
        debug!("Declared render pass '{}' ({:?})", name, id);
        id
    }

    /// Pass declared as `name`, if any.
    pub fn find(&self, name: &str) -> Option<PassId> {
        self.by_name.get(name).copied()
    }

    fn node(&self, id: PassId) -> &PassNode {
        match self.nodes.get(id.index()) {
            Some(node) => node,
            None => fatal!("Unknown render pass {:?}", id),
        }
    }

    fn node_mut(&mut self, id: PassId) -> &mut PassNode {
        match self.nodes.get_mut(id.index()) {
            Some(node) => node,
            None => fatal!("Unknown render pass {:?}", id),
        }
    }

    /// Makes `child` render before `parent`.
    ///
    /// # Panics
    ///
    /// Fatal for unknown passes, self-links and links closing a cycle.
    pub fn add_child(&mut self, parent: PassId, child: PassId) {
        self.node(parent);
        self.node(child);
        if parent == child {
            fatal!("Render pass '{}' cannot be its own child", self.node(parent).name);
        }
        if self.node(parent).children.contains(&child) {
            return;
        }
        if self.reaches(child, parent) {
            fatal!(
                "Linking '{}' under '{}' would create a cycle",
                self.node(child).name,
                self.node(parent).name
            );
        }

        self.node_mut(parent).children.push(child);
        self.node_mut(child).parents.push(parent);
    }

    /// Whether `to` is reachable from `from` through child links.
    fn reaches(&self, from: PassId, to: PassId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            stack.extend(self.node(id).children.iter().copied());
        }
        false
    }

    /// Installs the closure that records `pass`'s draws.
    pub fn set_draw_callback(
        &mut self,
        pass: PassId,
        callback: impl FnMut(&PassRecorder<'_>) + Send + 'static,
    ) {
        self.node_mut(pass).on_draw = Some(Box::new(callback));
    }

    // ========================================================================== //
    // Surface
    // ========================================================================== //

    /// Rebuilds every pass's framebuffers for a new swapchain.
    ///
    /// The device must be idle. Delivering the same rebuild twice is a
    /// no-op.
    pub fn on_surface_recreated(&mut self, event: &SurfaceRecreated) {
        if self
            .surface
            .as_ref()
            .is_some_and(|current| current.generation == event.generation)
        {
            return;
        }
        self.surface = Some(event.clone());

        for index in 0..self.nodes.len() {
            let id = PassId(index as u32);
            if let Err(e) = self.rebuild_framebuffers(id) {
                fatal!(
                    "Failed to rebuild attachments for pass '{}': {}",
                    self.node(id).name,
                    e
                );
            }
        }
        info!(
            "Render graph resized to {}x{} ({} pass(es), {} attachment image(s))",
            event.extent.width,
            event.extent.height,
            self.nodes.len(),
            self.images.len()
        );
    }

    fn rebuild_framebuffers(&mut self, id: PassId) -> RhiResult<()> {
        let Some(surface) = self.surface.as_ref() else {
            return Ok(());
        };
        let device = &self.device;
        let images = &mut self.images;
        let node = &mut self.nodes[id.index()];

        let old = node.framebuffers.try_recreate(|index| {
            build_framebuffer(
                device,
                images,
                &node.attachments,
                node.is_present,
                surface,
                index,
            )
        })?;
        for framebuffer in old {
            release_framebuffer(device, images, &framebuffer);
        }
        Ok(())
    }

    // ========================================================================== //
    // Recording
    // ========================================================================== //

    /// Records every pass reachable from the roots into `frame`, children
    /// before parents. Each pass is recorded once per frame even with
    /// several parents.
    ///
    /// The frame must come from the surface generation the graph was last
    /// rebuilt for. Anything else would present an image the graph never
    /// transitioned, so a mismatch is fatal.
    pub fn generate(&mut self, frame: &FrameHandle) {
        let Some(generation) = self.surface.as_ref().map(|s| s.generation) else {
            fatal!(
                "Render graph has no surface but was given a frame from surface generation {}",
                frame.surface_generation()
            );
        };
        if generation != frame.surface_generation() {
            fatal!(
                "Frame from surface generation {} but render graph is at generation {}",
                frame.surface_generation(),
                generation
            );
        }

        for node in &mut self.nodes {
            node.visited = false;
        }
        let roots: Vec<PassId> = (0..self.nodes.len())
            .map(|index| PassId(index as u32))
            .filter(|id| self.nodes[id.index()].parents.is_empty())
            .collect();
        for root in roots {
            self.visit(root, frame);
        }
    }

    fn visit(&mut self, id: PassId, frame: &FrameHandle) {
        if std::mem::replace(&mut self.nodes[id.index()].visited, true) {
            return;
        }
        let children = self.nodes[id.index()].children.clone();
        for child in children {
            self.visit(child, frame);
        }
        self.record(id, frame);
    }

    fn record(&mut self, id: PassId, frame: &FrameHandle) {
        let command_buffer = frame.command_buffer();
        let node = &mut self.nodes[id.index()];
        let framebuffer = node.framebuffers.get_mut(frame.image_index() as usize);

        command_buffer.begin_label(&node.name);

        let mut targets = Vec::with_capacity(framebuffer.attachments.len());
        for (attachment, desc) in framebuffer.attachments.iter_mut().zip(&node.attachments) {
            let layout = if desc.is_depth() {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            let old_layout = if desc.load_op == vk::AttachmentLoadOp::LOAD {
                attachment.layout
            } else {
                vk::ImageLayout::UNDEFINED
            };
            command_buffer.transition_image(
                attachment.image,
                aspect_for_format(attachment.format),
                old_layout,
                layout,
            );
            attachment.layout = layout;

            targets.push(TargetAttachment {
                view: attachment.view,
                format: attachment.format,
                load_op: desc.load_op,
                store_op: desc.store_op,
                clear_color: desc.clear_color,
                clear_depth: desc.clear_depth,
            });
        }

        command_buffer.begin_rendering(&RenderTarget {
            extent: framebuffer.extent,
            attachments: &targets,
        });
        command_buffer.set_viewport_scissor(framebuffer.extent);

        if let Some(on_draw) = node.on_draw.as_mut() {
            on_draw(&PassRecorder {
                pass: id,
                name: &node.name,
                command_buffer,
                extent: framebuffer.extent,
                image_index: frame.image_index(),
                frame_id: frame.frame_id(),
            });
        }

        command_buffer.end_rendering();

        for attachment in &mut framebuffer.attachments {
            let final_layout = match (node.is_present, attachment.source) {
                (true, AttachmentSource::Swapchain) => vk::ImageLayout::PRESENT_SRC_KHR,
                (true, AttachmentSource::Owned(_)) => continue,
                (false, _) => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };
            command_buffer.transition_image(
                attachment.image,
                aspect_for_format(attachment.format),
                attachment.layout,
                final_layout,
            );
            attachment.layout = final_layout;
        }

        command_buffer.end_label();
    }

    // ========================================================================== //
    // Queries
    // ========================================================================== //

    /// Number of declared passes.
    pub fn pass_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn name(&self, pass: PassId) -> &str {
        &self.node(pass).name
    }

    /// Passes recorded before `pass`, in link order.
    pub fn children(&self, pass: PassId) -> &[PassId] {
        &self.node(pass).children
    }

    /// Passes that read `pass`'s outputs.
    pub fn parents(&self, pass: PassId) -> &[PassId] {
        &self.node(pass).parents
    }

    pub fn is_present(&self, pass: PassId) -> bool {
        self.node(pass).is_present
    }

    /// Framebuffer of `pass` for presentable image `image_index`.
    pub fn framebuffer(&self, pass: PassId, image_index: usize) -> &Framebuffer {
        self.node(pass).framebuffers.get(image_index)
    }

    /// Extent shared by `pass`'s framebuffers, `None` before a surface exists.
    pub fn framebuffer_extent(&self, pass: PassId) -> Option<vk::Extent2D> {
        let node = self.node(pass);
        node.framebuffers
            .iter()
            .next()
            .filter(|_| self.surface.is_some())
            .map(Framebuffer::extent)
    }

    /// One per presentable image once a surface exists.
    pub fn framebuffer_count(&self, pass: PassId) -> usize {
        self.node(pass).framebuffers.max_instance_count()
    }

    /// Device-local attachment images currently alive.
    pub fn attachment_image_count(&self) -> usize {
        self.images.len()
    }

    // ========================================================================== //
    // Teardown
    // ========================================================================== //

    /// Destroys every attachment image and forgets every pass.
    ///
    /// The device must be idle.
    pub fn destroy(&mut self) {
        for image in self.images.drain() {
            self.device.destroy_attachment(&image);
        }
        let count = self.nodes.len();
        self.nodes.clear();
        self.by_name.clear();
        self.surface = None;
        if count > 0 {
            debug!("Render graph destroyed ({} pass(es))", count);
        }
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn build_framebuffer(
    device: &SharedDevice,
    images: &mut ResourceArena<AttachmentImage>,
    descs: &[AttachmentDesc],
    is_present: bool,
    surface: &SurfaceRecreated,
    index: usize,
) -> RhiResult<Framebuffer> {
    let mut attachments = Vec::with_capacity(descs.len());
    let mut swapchain_bound = false;

    for desc in descs {
        if is_present && !swapchain_bound && !desc.is_depth() {
            let (Some(&image), Some(&view)) = (surface.images.get(index), surface.views.get(index))
            else {
                fatal!(
                    "Presentable image {} missing from a surface with {} image(s)",
                    index,
                    surface.image_count()
                );
            };
            swapchain_bound = true;
            attachments.push(FramebufferAttachment {
                source: AttachmentSource::Swapchain,
                image,
                view,
                format: surface.format,
                layout: vk::ImageLayout::UNDEFINED,
            });
            continue;
        }

        let image = device.create_attachment(desc, surface.extent)?;
        let handle = images.insert(image);
        attachments.push(FramebufferAttachment {
            source: AttachmentSource::Owned(handle),
            image: image.image,
            view: image.view,
            format: image.format,
            layout: vk::ImageLayout::UNDEFINED,
        });
    }

    Ok(Framebuffer {
        extent: surface.extent,
        attachments,
    })
}

fn release_framebuffer(
    device: &SharedDevice,
    images: &mut ResourceArena<AttachmentImage>,
    framebuffer: &Framebuffer,
) {
    for attachment in &framebuffer.attachments {
        if let AttachmentSource::Owned(handle) = attachment.source
            && let Some(image) = images.remove(handle)
        {
            device.destroy_attachment(&image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepace_rhi::headless::HeadlessDevice;

    fn graph() -> RenderGraph {
        RenderGraph::new(Arc::new(HeadlessDevice::new()), FrameCounts::new(2, 2))
    }

    fn color(name: &str) -> Vec<AttachmentDesc> {
        vec![AttachmentDesc::color(name, vk::Format::R8G8B8A8_UNORM, [0.0; 4])]
    }

    fn surface(generation: u64, width: u32, height: u32) -> SurfaceRecreated {
        SurfaceRecreated {
            extent: vk::Extent2D { width, height },
            format: vk::Format::B8G8R8A8_SRGB,
            images: vec![vk::Image::null(); 2],
            views: vec![vk::ImageView::null(); 2],
            generation,
        }
    }

    #[test]
    fn test_declare_then_find() {
        let mut graph = graph();
        let id = graph.declare("gbuffer", color("albedo"), false);

        assert_eq!(graph.find("gbuffer"), Some(id));
        assert_eq!(graph.find("missing"), None);
        assert_eq!(graph.name(id), "gbuffer");
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_declaration_is_fatal() {
        let mut graph = graph();
        graph.declare("main", color("a"), false);
        graph.declare("main", color("b"), false);
    }

    #[test]
    #[should_panic(expected = "would create a cycle")]
    fn test_cycle_is_fatal() {
        let mut graph = graph();
        let a = graph.declare("a", color("a"), false);
        let b = graph.declare("b", color("b"), false);
        let c = graph.declare("c", color("c"), false);
        graph.add_child(a, b);
        graph.add_child(b, c);
        graph.add_child(c, a);
    }

    #[test]
    #[should_panic(expected = "own child")]
    fn test_self_link_is_fatal() {
        let mut graph = graph();
        let a = graph.declare("a", color("a"), false);
        graph.add_child(a, a);
    }

    #[test]
    #[should_panic(expected = "no color attachment")]
    fn test_present_pass_needs_color() {
        let mut graph = graph();
        graph.declare(
            "present",
            vec![AttachmentDesc::depth("depth", vk::Format::D32_SFLOAT)],
            true,
        );
    }

    #[test]
    fn test_links_are_recorded_once() {
        let mut graph = graph();
        let main = graph.declare("main", color("main"), true);
        let shadow = graph.declare("shadow", color("shadow"), false);
        graph.add_child(main, shadow);
        graph.add_child(main, shadow);

        assert_eq!(graph.children(main), &[shadow]);
        assert_eq!(graph.parents(shadow), &[main]);
    }

    #[test]
    fn test_surface_rebuild_is_idempotent() {
        let mut graph = graph();
        let main = graph.declare(
            "main",
            vec![
                AttachmentDesc::color("backbuffer", vk::Format::B8G8R8A8_SRGB, [0.0; 4]),
                AttachmentDesc::depth("depth", vk::Format::D32_SFLOAT),
            ],
            true,
        );
        assert_eq!(graph.framebuffer_extent(main), None);

        let event = surface(1, 640, 480);
        graph.on_surface_recreated(&event);
        let first = graph.framebuffer(main, 1).views();
        graph.on_surface_recreated(&event);

        assert_eq!(graph.framebuffer(main, 1).views(), first);
        assert_eq!(
            graph.framebuffer_extent(main),
            Some(vk::Extent2D {
                width: 640,
                height: 480
            })
        );
        // One depth image per presentable image; the color target is the swapchain.
        assert_eq!(graph.attachment_image_count(), 2);
    }

    #[test]
    fn test_new_surface_replaces_attachments() {
        let mut graph = graph();
        let pass = graph.declare("post", color("post"), false);
        graph.on_surface_recreated(&surface(1, 640, 480));
        let before = graph.framebuffer(pass, 0).images();

        graph.on_surface_recreated(&surface(2, 1280, 720));

        assert_ne!(graph.framebuffer(pass, 0).images(), before);
        assert_eq!(graph.attachment_image_count(), 2);
        assert_eq!(graph.framebuffer(pass, 0).extent().width, 1280);
    }
}
