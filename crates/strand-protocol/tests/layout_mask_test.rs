//! Integration test: binding layout masks
//!
//! Run with: cargo test -p strand-protocol --test layout_mask_test

use strand_protocol::*;

fn binding(slot: u8, kind: BindingKind, stages: ShaderStages) -> SetLayoutBinding {
    SetLayoutBinding {
        binding: slot,
        kind,
        stages,
    }
}

#[test]
fn test_external_sampler_sets_sampler_bit() {
    let descriptor = SetLayoutDescriptor {
        bindings: vec![
            binding(0, BindingKind::UniformBuffer, ShaderStages::VERTEX | ShaderStages::FRAGMENT),
            binding(1, BindingKind::Sampler, ShaderStages::FRAGMENT),
            binding(2, BindingKind::ExternalSampler, ShaderStages::FRAGMENT),
        ],
    };
    let mask = LayoutMask::from_descriptor(&descriptor);

    assert_eq!(mask.uniform, 0b001);
    assert_eq!(mask.sampler, 0b110);
    assert_eq!(mask.external_sampler, 0b100);
    assert_eq!(mask.slots(), 0b111);
    assert_eq!(mask.kind_of(2), Some(BindingKind::ExternalSampler));
    assert_eq!(mask.kind_of(1), Some(BindingKind::Sampler));
    assert_eq!(mask.kind_of(5), None);
    assert_eq!(mask.stages_of(0), ShaderStages::VERTEX | ShaderStages::FRAGMENT);

    let counts = mask.counts();
    assert_eq!(counts.uniform, 1);
    assert_eq!(counts.sampler, 2);
    assert_eq!(counts.scaled(64).sampler, 128);
}

#[test]
#[should_panic(expected = "exceeds the maximum")]
fn test_slot_out_of_range_is_fatal() {
    let descriptor = SetLayoutDescriptor {
        bindings: vec![binding(MAX_BINDINGS, BindingKind::Sampler, ShaderStages::FRAGMENT)],
    };
    let _ = LayoutMask::from_descriptor(&descriptor);
}
