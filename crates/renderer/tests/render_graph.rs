mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use framepace_renderer::{RenderGraph, SurfaceRecreated};
use framepace_rhi::headless::DeviceEvent;
use framepace_rhi::{AttachmentDesc, vk};

use common::{backbuffer, context};

fn offscreen(name: &str) -> Vec<AttachmentDesc> {
    vec![AttachmentDesc::color(name, vk::Format::R16G16B16A16_SFLOAT, [0.0; 4])]
}

fn labels(events: &[DeviceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::LabelBegun(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_declared_pass_is_found_by_name() {
    let (_device, mut context) = context(2);
    let present = context.declare_render_pass("present", backbuffer(), true);
    let bloom = context.declare_render_pass("bloom", offscreen("bloom"), false);

    assert_eq!(context.find_render_pass("present"), Some(present));
    assert_eq!(context.find_render_pass("bloom"), Some(bloom));
    assert_ne!(present, bloom);
    assert_eq!(context.find_render_pass("ssao"), None);
}

#[test]
#[should_panic(expected = "declared twice")]
fn test_declaring_a_name_twice_is_fatal() {
    let (_device, mut context) = context(2);
    context.declare_render_pass("present", backbuffer(), true);
    context.declare_render_pass("present", offscreen("other"), false);
}

#[test]
#[should_panic(expected = "Unknown render pass")]
fn test_linking_an_unknown_pass_is_fatal() {
    let (_device, mut context) = context(2);
    let present = context.declare_render_pass("present", backbuffer(), true);

    let (_other_device, mut other) = common::context(2);
    other.declare_render_pass("a", offscreen("a"), false);
    let foreign = other.declare_render_pass("b", offscreen("b"), false);

    context.add_child(present, foreign);
}

#[test]
fn test_children_record_before_parents_once_per_frame() {
    let (device, mut context) = context(2);
    let present = context.declare_render_pass("present", backbuffer(), true);
    let lighting = context.declare_render_pass("lighting", offscreen("lit"), false);
    let bloom = context.declare_render_pass("bloom", offscreen("bloom"), false);
    let gbuffer = context.declare_render_pass("gbuffer", offscreen("albedo"), false);
    context.add_child(present, lighting);
    context.add_child(present, bloom);
    context.add_child(lighting, gbuffer);
    context.add_child(bloom, gbuffer);
    device.clear_events();

    assert!(context.draw_frame());
    assert_eq!(
        labels(&device.events()),
        vec!["gbuffer", "lighting", "bloom", "present"]
    );

    device.clear_events();
    assert!(context.draw_frame());
    assert_eq!(labels(&device.events()).len(), 4);
}

#[test]
fn test_output_layouts_follow_pass_kind() {
    let (device, mut context) = context(2);
    let present = context.declare_render_pass("present", backbuffer(), true);
    let shadow = context.declare_render_pass(
        "shadow",
        vec![AttachmentDesc::depth("shadow_depth", vk::Format::D32_SFLOAT)],
        false,
    );
    context.add_child(present, shadow);
    device.clear_events();

    let frame = context.acquire_frame().unwrap();
    let image = frame.image_index() as usize;
    context.record(&frame);
    context.submit_frame(frame);

    let swapchain_image = context.scheduler().swapchain().unwrap().images()[image];
    let shadow_image = context.graph().framebuffer(shadow, image).images()[0];
    let events = device.events();

    assert!(events.contains(&DeviceEvent::ImageTransitioned {
        image: swapchain_image,
        new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    }));
    assert!(events.contains(&DeviceEvent::ImageTransitioned {
        image: shadow_image,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }));
    assert_eq!(
        context.graph().framebuffer(shadow, image).layout(0),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
}

#[test]
fn test_draw_callback_runs_inside_rendering_scope() {
    let (device, mut context) = context(2);
    let present = context.declare_render_pass("present", backbuffer(), true);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen_extent = Arc::new(Mutex::new(vk::Extent2D::default()));

    let counter = Arc::clone(&calls);
    let extent = Arc::clone(&seen_extent);
    context.set_draw_callback(present, move |pass| {
        assert_eq!(pass.name, "present");
        counter.fetch_add(1, Ordering::SeqCst);
        *extent.lock().unwrap() = pass.extent;
        pass.command_buffer.begin_label("draw");
        pass.command_buffer.end_label();
    });
    device.clear_events();

    for _ in 0..3 {
        assert!(context.draw_frame());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *seen_extent.lock().unwrap(),
        vk::Extent2D {
            width: 800,
            height: 600
        }
    );

    let events = device.events();
    let begin = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::RenderingBegun { .. }))
        .unwrap();
    let draw = events
        .iter()
        .position(|e| *e == DeviceEvent::LabelBegun("draw".to_string()))
        .unwrap();
    let end = events
        .iter()
        .position(|e| *e == DeviceEvent::RenderingEnded)
        .unwrap();
    assert!(begin < draw && draw < end);
}

#[test]
fn test_framebuffers_follow_surface_resize() {
    let (device, mut context) = context(2);
    let present = context.declare_render_pass("present", backbuffer(), true);
    let post = context.declare_render_pass("post", offscreen("post"), false);
    context.add_child(present, post);
    assert_eq!(
        context.graph().framebuffer_extent(post),
        Some(vk::Extent2D {
            width: 800,
            height: 600
        })
    );

    device.set_surface_extent(1280, 720);
    context.resize(1280, 720);
    assert!(context.draw_frame());

    let resized = vk::Extent2D {
        width: 1280,
        height: 720,
    };
    assert_eq!(context.graph().framebuffer_extent(present), Some(resized));
    assert_eq!(context.graph().framebuffer_extent(post), Some(resized));
    assert_eq!(
        context.graph().framebuffer_count(post),
        context.counts().image_count()
    );
    // Only the offscreen pass owns images: one per presentable image.
    assert_eq!(
        context.graph().attachment_image_count(),
        context.counts().image_count()
    );
}

#[test]
fn test_same_surface_twice_gives_same_framebuffers() {
    let (device, mut context) = context(2);
    let captured: Arc<Mutex<Option<SurfaceRecreated>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    context.on_surface_recreated(move |event| {
        *sink.lock().unwrap() = Some(event.clone());
    });
    device.set_surface_extent(640, 480);
    context.resize(640, 480);
    assert!(context.draw_frame());
    let event = captured.lock().unwrap().clone().unwrap();

    let mut graph = RenderGraph::new(device.clone(), Arc::clone(context.counts()));
    let pass = graph.declare("present", backbuffer(), true);

    graph.on_surface_recreated(&event);
    let first: Vec<_> = (0..event.image_count())
        .map(|i| (graph.framebuffer(pass, i).extent(), graph.framebuffer(pass, i).views()))
        .collect();
    graph.on_surface_recreated(&event);
    let second: Vec<_> = (0..event.image_count())
        .map(|i| (graph.framebuffer(pass, i).extent(), graph.framebuffer(pass, i).views()))
        .collect();

    assert_eq!(first, second);
    assert_eq!(first[0].0, vk::Extent2D { width: 640, height: 480 });
    assert_eq!(first[1].1, vec![event.views[1]]);
}

#[test]
#[should_panic(expected = "render graph is at generation")]
fn test_frame_from_other_surface_generation_is_fatal() {
    let (device, mut context) = context(2);
    let frame = context.acquire_frame().unwrap();
    let swapchain = context.scheduler().swapchain().unwrap();
    let newer = SurfaceRecreated {
        extent: swapchain.extent(),
        format: swapchain.format(),
        images: swapchain.images().to_vec(),
        views: swapchain.image_views().to_vec(),
        generation: frame.surface_generation() + 1,
    };

    let mut graph = RenderGraph::new(device.clone(), Arc::clone(context.counts()));
    graph.declare("present", backbuffer(), true);
    graph.on_surface_recreated(&newer);
    graph.generate(&frame);
}

#[test]
#[should_panic(expected = "has no surface")]
fn test_recording_before_any_surface_is_fatal() {
    let (device, mut context) = context(2);
    let frame = context.acquire_frame().unwrap();

    let mut graph = RenderGraph::new(device.clone(), Arc::clone(context.counts()));
    graph.declare("present", backbuffer(), true);
    graph.generate(&frame);
}
