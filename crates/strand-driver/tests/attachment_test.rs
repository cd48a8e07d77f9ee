//! Integration test: render targets, passes and framebuffers
//!
//! Covers sample-count clamping with multisample sidecars, render pass and
//! framebuffer caching, eviction on texture destruction, transient
//! swap-chain framebuffers and the coordinate conversions applied inside a
//! pass.
//!
//! Run with: cargo test -p strand-driver --test attachment_test

use std::time::{Duration, Instant};

use strand_common::init_test_logging;
use strand_core::{FenceStatus, StrandConfig};
use strand_driver::{Engine, HeadlessBackend, HeadlessProbe, NativeCall};
use strand_protocol::*;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn start() -> (Engine, HeadlessProbe) {
    init_test_logging();
    Engine::headless(&StrandConfig::default()).expect("headless engine starts")
}

fn start_with_samples(color: SampleCounts, depth: SampleCounts) -> (Engine, HeadlessProbe) {
    init_test_logging();
    let (backend, probe) = HeadlessBackend::new();
    probe.set_sample_counts(color, depth);
    let engine = Engine::with_backend(move || Ok(backend), &StrandConfig::default())
        .expect("headless engine starts");
    (engine, probe)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn color(engine: &mut Engine, size: u32) -> TextureHandle {
    engine.create_texture(TextureDescriptor::new_2d(
        TextureFormat::Rgba8,
        size,
        size,
        TextureUsage::COLOR_ATTACHMENT,
    ))
}

fn target(engine: &mut Engine, texture: TextureHandle, size: u32, samples: u8) -> RenderTargetHandle {
    engine.create_render_target(RenderTargetDescriptor {
        width: size,
        height: size,
        color: vec![Attachment::new(texture)],
        depth: None,
        samples,
        layer_count: 1,
    })
}

fn empty_pass(engine: &mut Engine, target: RenderTargetHandle, params: RenderPassParams) {
    engine.begin_render_pass(target, params);
    engine.end_render_pass();
}

fn is_framebuffer_destroy(call: &NativeCall) -> bool {
    matches!(call, NativeCall::DestroyFramebuffer(_))
}

// ── Sample counts ───────────────────────────────────────────

#[test]
fn test_sample_count_clamped_to_device_support() {
    let (mut engine, probe) =
        start_with_samples(SampleCounts::S1 | SampleCounts::S2, SampleCounts::S1 | SampleCounts::S2);

    let texture = color(&mut engine, 64);
    let first = target(&mut engine, texture, 64, 4);
    let second = target(&mut engine, texture, 64, 4);
    empty_pass(&mut engine, first, RenderPassParams::default());
    empty_pass(&mut engine, second, RenderPassParams::default());
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateTexture { samples: 2, .. })),
        1,
        "one sidecar shared by both targets"
    );
    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateTexture { samples: 4, .. })),
        0
    );
    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateRenderPass { samples: 2, .. })),
        1
    );
}

#[test]
fn test_depth_support_limits_combined_sample_count() {
    let (mut engine, probe) = start_with_samples(
        SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4,
        SampleCounts::S1,
    );

    let texture = color(&mut engine, 32);
    let depth = engine.create_texture(TextureDescriptor::new_2d(
        TextureFormat::Depth24,
        32,
        32,
        TextureUsage::DEPTH_ATTACHMENT,
    ));
    let target = engine.create_render_target(RenderTargetDescriptor {
        width: 32,
        height: 32,
        color: vec![Attachment::new(texture)],
        depth: Some(Attachment::new(depth)),
        samples: 4,
        layer_count: 1,
    });
    empty_pass(&mut engine, target, RenderPassParams::default());
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateTexture { samples, .. } if *samples > 1)),
        0
    );
    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateRenderPass { samples: 1, .. })),
        1
    );
}

// ── Caching ─────────────────────────────────────────────────

#[test]
fn test_passes_and_framebuffers_are_cached() {
    let (mut engine, probe) = start();

    let texture = color(&mut engine, 128);
    let target = target(&mut engine, texture, 128, 1);
    for _ in 0..3 {
        empty_pass(&mut engine, target, RenderPassParams::default());
    }
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    assert_eq!(probe.count(|c| matches!(c, NativeCall::CreateRenderPass { .. })), 1);
    assert_eq!(probe.count(|c| matches!(c, NativeCall::CreateFramebuffer { .. })), 1);
    assert_eq!(probe.count(|c| matches!(c, NativeCall::BeginRenderPass { .. })), 3);

    // Clearing changes the load operations, so the pass is a different one.
    let clearing = RenderPassParams {
        clear: TargetBufferFlags::COLOR0,
        ..RenderPassParams::default()
    };
    empty_pass(&mut engine, target, clearing);
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    assert_eq!(probe.count(|c| matches!(c, NativeCall::CreateRenderPass { .. })), 2);
    let stats = engine.get_stats();
    assert_eq!(stats.cached_render_passes, 2);
    assert_eq!(stats.cached_framebuffers, 2);
    assert_eq!(stats.render_passes, 4);
}

#[test]
fn test_destroying_a_texture_evicts_its_framebuffer() {
    let (mut engine, probe) = start();

    let texture = color(&mut engine, 64);
    let target = target(&mut engine, texture, 64, 1);
    empty_pass(&mut engine, target, RenderPassParams::default());
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);
    assert_eq!(engine.get_stats().cached_framebuffers, 1);

    engine.destroy_render_target(target);
    engine.destroy_texture(texture);
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    wait_until("texture destruction", || {
        probe.count(|c| matches!(c, NativeCall::DestroyTexture(_))) == 1
    });
    assert_eq!(probe.count(is_framebuffer_destroy), 1);
    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::DestroyRenderPass(_))),
        0,
        "the render pass does not reference the texture"
    );

    let calls = probe.calls();
    let framebuffer = calls.iter().position(is_framebuffer_destroy);
    let texture = calls
        .iter()
        .position(|c| matches!(c, NativeCall::DestroyTexture(_)));
    assert!(framebuffer < texture, "framebuffer outlived its image: {calls:?}");
    assert_eq!(engine.get_stats().cached_framebuffers, 0);
}

#[test]
fn test_clear_attachment_cache_recreates_on_next_pass() {
    let (mut engine, probe) = start();

    let texture = color(&mut engine, 64);
    let target = target(&mut engine, texture, 64, 1);
    empty_pass(&mut engine, target, RenderPassParams::default());
    engine.clear_attachment_cache();
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    wait_until("render pass destruction", || {
        probe.count(|c| matches!(c, NativeCall::DestroyRenderPass(_))) == 1
    });
    assert_eq!(probe.count(is_framebuffer_destroy), 1);

    empty_pass(&mut engine, target, RenderPassParams::default());
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);
    assert_eq!(probe.count(|c| matches!(c, NativeCall::CreateRenderPass { .. })), 2);
    assert_eq!(probe.count(|c| matches!(c, NativeCall::CreateFramebuffer { .. })), 2);
}

#[test]
fn test_odd_sample_count_never_exceeds_device_support() {
    let (mut engine, probe) = start_with_samples(
        SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4,
        SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4,
    );

    let texture = color(&mut engine, 32);
    let target = target(&mut engine, texture, 32, 12);
    empty_pass(&mut engine, target, RenderPassParams::default());
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateTexture { samples: 4, .. })),
        1
    );
    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateTexture { samples, .. } if *samples > 4)),
        0
    );
    assert_eq!(
        probe.count(|c| matches!(c, NativeCall::CreateRenderPass { samples: 4, .. })),
        1
    );
}

#[test]
#[should_panic(expected = "render target must have at least one attachment")]
fn test_render_target_without_attachments_is_rejected() {
    let (mut engine, _probe) = start();

    engine.create_render_target(RenderTargetDescriptor {
        width: 64,
        height: 64,
        color: Vec::new(),
        depth: None,
        samples: 1,
        layer_count: 1,
    });
}

#[test]
#[should_panic(expected = "exceeding the maximum")]
fn test_render_target_with_too_many_colors_is_rejected() {
    let (mut engine, _probe) = start();

    let colors = (0..MAX_COLOR_ATTACHMENTS + 1)
        .map(|_| Attachment::new(color(&mut engine, 16)))
        .collect();
    engine.create_render_target(RenderTargetDescriptor {
        width: 16,
        height: 16,
        color: colors,
        depth: None,
        samples: 1,
        layer_count: 1,
    });
}

// ── Swap chains ─────────────────────────────────────────────

#[test]
fn test_swap_chain_framebuffer_destroyed_after_retire() {
    let (mut engine, probe) = start();
    probe.set_manual_retirement(true);

    let swap_chain = engine.create_swap_chain(SwapChainDescriptor {
        width: 64,
        height: 64,
        format: TextureFormat::Bgra8,
        image_count: 2,
    });
    let target = engine.create_swap_chain_render_target(swap_chain);
    engine.begin_frame(swap_chain);
    empty_pass(&mut engine, target, RenderPassParams::default());
    engine.end_frame(swap_chain);
    let seq = engine.flush();

    wait_until("frame submitted", || probe.submitted() >= seq);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.count(|c| matches!(c, NativeCall::Present { .. })), 1);
    assert_eq!(probe.count(is_framebuffer_destroy), 0, "framebuffer freed while in flight");

    probe.retire_up_to(seq);
    wait_until("framebuffer destruction", || probe.count(is_framebuffer_destroy) == 1);
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);
    assert_eq!(engine.get_stats().cached_framebuffers, 0);
}

#[test]
fn test_swap_chain_images_rotate_across_frames() {
    let (mut engine, probe) = start();

    let swap_chain = engine.create_swap_chain(SwapChainDescriptor {
        width: 32,
        height: 32,
        format: TextureFormat::Bgra8,
        image_count: 2,
    });
    let target = engine.create_swap_chain_render_target(swap_chain);
    for _ in 0..3 {
        engine.begin_frame(swap_chain);
        empty_pass(&mut engine, target, RenderPassParams::default());
        engine.end_frame(swap_chain);
        engine.flush();
    }
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    let presented: Vec<u32> = probe
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::Present { image, .. } => Some(image),
            _ => None,
        })
        .collect();
    assert_eq!(presented, vec![0, 1, 0]);
    assert_eq!(engine.get_stats().frames_presented, 3);
    assert_eq!(probe.count(|c| matches!(c, NativeCall::CreateRenderPass { .. })), 1);
}

// ── Coordinates ─────────────────────────────────────────────

#[test]
fn test_scissor_is_clamped_and_viewport_flipped() {
    let (mut engine, probe) = start();

    let texture = color(&mut engine, 256);
    let target = target(&mut engine, texture, 256, 1);
    engine.begin_render_pass(target, RenderPassParams::default());
    engine.set_scissor(Rect2D::new(-10, -10, 100, 100));
    engine.set_scissor(Rect2D::new(-10, -10, 1000, 1000));
    engine.set_viewport(Rect2D::new(0, 0, 128, 64));
    engine.end_render_pass();
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    let scissors: Vec<Rect2D> = probe
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::SetScissor(rect) => Some(rect),
            _ => None,
        })
        .collect();
    assert_eq!(
        scissors,
        vec![
            Rect2D::new(0, 0, 256, 256),
            Rect2D::new(0, 166, 90, 90),
            Rect2D::new(0, 0, 256, 256),
        ]
    );
    assert!(probe
        .calls()
        .contains(&NativeCall::SetViewport(Rect2D::new(0, 192, 128, 64))));
}

#[test]
fn test_pass_viewport_defaults_to_full_target() {
    let (mut engine, probe) = start();

    let texture = color(&mut engine, 96);
    let target = target(&mut engine, texture, 96, 1);
    let params = RenderPassParams {
        viewport: Rect2D::new(0, 0, 48, 32),
        ..RenderPassParams::default()
    };
    empty_pass(&mut engine, target, RenderPassParams::default());
    empty_pass(&mut engine, target, params);
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    let viewports: Vec<Rect2D> = probe
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::SetViewport(rect) => Some(rect),
            _ => None,
        })
        .collect();
    assert_eq!(
        viewports,
        vec![Rect2D::new(0, 0, 96, 96), Rect2D::new(0, 64, 48, 32)]
    );
}
