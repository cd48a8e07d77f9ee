//! Integration test: coordinate conversion and sample-count reduction
//!
//! Run with: cargo test -p strand-core --test geometry_test

use strand_core::coords::{clamp_scissor, flip_viewport};
use strand_core::{reduce_sample_count, ImageLayout};
use strand_protocol::{Rect2D, SampleCounts, TextureFormat};

#[test]
fn test_viewport_flip_is_exact() {
    let flipped = flip_viewport(Rect2D::new(5, 10, 30, 20), 100);
    assert_eq!(flipped, Rect2D::new(5, 70, 30, 20));

    // Full-screen viewports map onto themselves.
    assert_eq!(flip_viewport(Rect2D::new(0, 0, 64, 48), 48), Rect2D::new(0, 0, 64, 48));
}

#[test]
fn test_scissor_is_flipped_and_clamped() {
    assert_eq!(
        clamp_scissor(Rect2D::new(0, 10, 50, 20), 100, 100),
        Rect2D::new(0, 70, 50, 20)
    );
    // Hanging off the left and bottom edges.
    assert_eq!(
        clamp_scissor(Rect2D::new(-10, 90, 40, 20), 100, 100),
        Rect2D::new(0, 0, 30, 10)
    );
    // Larger than the framebuffer.
    assert_eq!(
        clamp_scissor(Rect2D::new(0, 0, 1000, 1000), 100, 100),
        Rect2D::new(0, 0, 100, 100)
    );
    // Entirely outside.
    let outside = clamp_scissor(Rect2D::new(200, 0, 10, 10), 100, 100);
    assert_eq!((outside.width, outside.height), (0, 10));
    assert_eq!(outside.x, 100);
}

#[test]
fn test_sample_count_clamped_to_both_masks() {
    let color = SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4;
    let depth = SampleCounts::S1 | SampleCounts::S2;
    assert_eq!(reduce_sample_count(4, color & depth), 2);
    assert_eq!(reduce_sample_count(4, color), 4);
    assert_eq!(reduce_sample_count(8, color), 4);
    assert_eq!(reduce_sample_count(1, depth), 1);
    assert_eq!(reduce_sample_count(0, depth), 1);
    assert_eq!(reduce_sample_count(16, SampleCounts::S1 | SampleCounts::S8), 8);
}

#[test]
fn test_odd_sample_counts_round_down_to_a_supported_power_of_two() {
    let mask = SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4;
    assert_eq!(reduce_sample_count(12, mask), 4);
    assert_eq!(reduce_sample_count(3, mask), 2);
    assert_eq!(reduce_sample_count(5, SampleCounts::S1 | SampleCounts::S4), 4);
    assert_eq!(reduce_sample_count(7, SampleCounts::S2), 2);
    assert_eq!(reduce_sample_count(255, SampleCounts::all()), 64);
    for samples in 0..=u8::MAX {
        let reduced = reduce_sample_count(samples, mask);
        assert!(reduced.is_power_of_two(), "{samples} -> {reduced}");
        assert!(reduced <= 4, "{samples} -> {reduced}");
        assert!(reduced <= samples.max(1), "{samples} -> {reduced}");
    }
}

#[test]
fn test_layouts_follow_format() {
    assert_eq!(
        ImageLayout::attachment_for(TextureFormat::Rgba8),
        ImageLayout::ColorAttachment
    );
    assert_eq!(
        ImageLayout::attachment_for(TextureFormat::Depth24Stencil8),
        ImageLayout::DepthAttachment
    );
    assert_eq!(ImageLayout::sampled_for(TextureFormat::Depth32F), ImageLayout::DepthRead);
    assert!(ImageLayout::ShaderRead.is_sampleable());
    assert!(!ImageLayout::Present.is_attachment());
}
