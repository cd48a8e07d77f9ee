//! Integration test: ResourceArena
//!
//! Exercises deferred destruction against a synthetic retirement frontier.
//!
//! Run with: cargo test -p strand-core --test arena_test

use strand_core::arena::{DescriptorSetDescriptor, ResourceArena};
use strand_core::ImageLayout;
use strand_protocol::*;

fn color_texture() -> TextureDescriptor {
    TextureDescriptor::new_2d(
        TextureFormat::Rgba8,
        256,
        256,
        TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLEABLE,
    )
}

#[test]
fn test_destruction_waits_for_retirement() {
    let arena = ResourceArena::new();
    let texture = arena.create(color_texture());

    // Buffer 3 references the texture, then the client drops it.
    arena.touch(&[texture.raw()], 3);
    arena.release(texture.raw());

    assert!(arena.collect(1).is_empty(), "destroyed before buffer 3 retired");
    assert!(arena.collect(2).is_empty(), "destroyed before buffer 3 retired");
    assert!(arena.is_live(texture.raw()));

    let retired = arena.collect(3);
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].handle, texture.raw());
    assert_eq!(retired[0].kind, ResourceKind::Texture);
    assert!(!arena.is_live(texture.raw()));
    assert_eq!(arena.pending(), 0);
}

#[test]
fn test_retain_keeps_resource_alive() {
    let arena = ResourceArena::new();
    let buffer = arena.create(BufferDescriptor {
        size: 64,
        usage: BufferUsage::UNIFORM,
    });
    arena.retain(buffer.raw());
    arena.release(buffer.raw());
    assert!(arena.collect(u64::MAX).is_empty());
    arena.release(buffer.raw());
    assert_eq!(arena.collect(u64::MAX).len(), 1);
}

#[test]
fn test_bound_resource_outlives_client_release() {
    let arena = ResourceArena::new();
    let buffer = arena.create(BufferDescriptor {
        size: 64,
        usage: BufferUsage::UNIFORM,
    });

    arena.hold_bound(buffer.raw());
    arena.touch(&[buffer.raw()], 2);
    arena.release(buffer.raw());
    assert!(arena.collect(u64::MAX).is_empty(), "destroyed while bound");

    // Unbound while recording buffer 5.
    arena.drop_bound(buffer.raw(), 5);
    assert!(arena.collect(4).is_empty());
    assert_eq!(arena.collect(5).len(), 1);
    assert!(!arena.is_live(buffer.raw()));
}

#[test]
fn test_slot_reuse_bumps_generation() {
    let arena = ResourceArena::new();
    let first = arena.create(color_texture());
    arena.release(first.raw());
    arena.collect(0);

    let second = arena.create(color_texture());
    assert_eq!(second.raw().index, first.raw().index);
    assert_ne!(second.raw().generation, first.raw().generation);
    assert!(arena.is_live(second.raw()));
    assert!(!arena.is_live(first.raw()));
}

#[test]
fn test_render_target_keeps_attachments_alive() {
    let arena = ResourceArena::new();
    let color = arena.create(color_texture());
    let target = arena.create(RenderTargetDescriptor {
        width: 256,
        height: 256,
        color: vec![Attachment::new(color)],
        depth: None,
        samples: 1,
        layer_count: 1,
    });

    arena.touch(&[color.raw()], 1);
    arena.release(color.raw());
    assert!(arena.collect(10).is_empty(), "still attached to a render target");

    // The target was last used by buffer 5; the attachment inherits that.
    arena.touch(&[target.raw()], 5);
    arena.release(target.raw());
    let retired = arena.collect(4);
    assert!(retired.is_empty());

    let retired = arena.collect(5);
    let handles: Vec<_> = retired.iter().map(|r| r.handle).collect();
    assert_eq!(handles, vec![target.raw(), color.raw()]);
}

#[test]
fn test_replaced_occupant_inherits_set_use() {
    let arena = ResourceArena::new();
    let layout = arena.create(SetLayoutDescriptor::default());
    let set = arena.create(DescriptorSetDescriptor { layout });
    let first = arena.create(color_texture());
    let second = arena.create(color_texture());

    arena.occupy(set.raw(), 0, first.raw(), 1);
    arena.release(first.raw());
    // The set is bound and drawn with in buffer 4.
    arena.touch_bound(&[set.raw()], 4);
    arena.occupy(set.raw(), 0, second.raw(), 5);

    assert!(arena.collect(4).is_empty(), "native set recorded in buffer 5 may use it");
    let retired = arena.collect(5);
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].handle, first.raw());
}

#[test]
fn test_sidecar_created_once_and_destroyed_with_base() {
    let arena = ResourceArena::new();
    let base = arena.create(color_texture());

    let (sidecar, created) = arena.sidecar(base, 4);
    assert!(created);
    let (again, created) = arena.sidecar(base, 4);
    assert!(!created);
    assert_eq!(sidecar, again);

    let twin = arena.texture_descriptor(sidecar);
    assert_eq!(twin.samples, 4);
    assert_eq!(twin.usage, TextureUsage::COLOR_ATTACHMENT);
    assert_eq!(arena.with_texture(base, |_, state| state.sidecar), Some(sidecar));

    arena.release(base.raw());
    let retired = arena.collect(0);
    assert_eq!(retired.len(), 2);
    assert!(!arena.is_live(sidecar.raw()));
}

#[test]
fn test_texture_state_is_tracked() {
    let arena = ResourceArena::new();
    let texture = arena.create(color_texture());
    arena.with_texture(texture, |descriptor, state| {
        assert_eq!(descriptor.width, 256);
        assert_eq!(state.layout, ImageLayout::Undefined);
        state.layout = ImageLayout::ColorAttachment;
        state.declared = Some(ImageLayout::ShaderRead);
    });
    let (layout, declared) = arena.with_texture(texture, |_, s| (s.layout, s.declared));
    assert_eq!(layout, ImageLayout::ColorAttachment);
    assert_eq!(declared, Some(ImageLayout::ShaderRead));
}

#[test]
#[should_panic(expected = "stale resource handle")]
fn test_stale_handle_is_fatal() {
    let arena = ResourceArena::new();
    let texture = arena.create(color_texture());
    arena.release(texture.raw());
    arena.collect(0);
    let _ = arena.texture_descriptor(texture);
}

#[test]
#[should_panic(expected = "cannot be referenced again")]
fn test_touching_released_handle_is_fatal() {
    let arena = ResourceArena::new();
    let texture = arena.create(color_texture());
    arena.release(texture.raw());
    arena.touch(&[texture.raw()], 2);
}

#[test]
#[should_panic(expected = "cannot be referenced again")]
fn test_retain_after_release_is_fatal() {
    let arena = ResourceArena::new();
    let texture = arena.create(color_texture());
    arena.release(texture.raw());
    arena.retain(texture.raw());
}
