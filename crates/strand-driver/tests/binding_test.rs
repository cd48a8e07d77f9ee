//! Integration test: descriptor binding
//!
//! Checks that native sets are content-addressed, written once and bound
//! only when what the program sees actually changes.
//!
//! Run with: cargo test -p strand-driver --test binding_test

use std::time::Duration;

use strand_common::init_test_logging;
use strand_core::{FenceStatus, StrandConfig};
use strand_driver::{Engine, HeadlessBackend, HeadlessProbe, NativeCall};
use strand_protocol::*;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));
const SPIRV_MAGIC: u32 = 0x0723_0203;

struct Scene {
    engine: Engine,
    probe: HeadlessProbe,
    layout: SetLayoutHandle,
    program: ProgramHandle,
    target: RenderTargetHandle,
}

impl Scene {
    fn new() -> Self {
        init_test_logging();
        let (mut engine, probe) = Engine::headless(&StrandConfig::default()).expect("engine starts");

        let layout = engine.create_set_layout(SetLayoutDescriptor {
            bindings: vec![SetLayoutBinding {
                binding: 0,
                kind: BindingKind::UniformBuffer,
                stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
            }],
        });
        let program = engine.create_program(ProgramDescriptor {
            name: "flat".to_string(),
            source: ShaderSource::Graphics {
                vertex: vec![SPIRV_MAGIC],
                fragment: vec![SPIRV_MAGIC],
            },
            set_layouts: vec![Some(layout)],
        });
        let color = engine.create_texture(TextureDescriptor::new_2d(
            TextureFormat::Rgba8,
            64,
            64,
            TextureUsage::COLOR_ATTACHMENT,
        ));
        let target = engine.create_render_target(RenderTargetDescriptor {
            width: 64,
            height: 64,
            color: vec![Attachment::new(color)],
            depth: None,
            samples: 1,
            layer_count: 1,
        });
        assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);
        probe.clear_calls();

        Self {
            engine,
            probe,
            layout,
            program,
            target,
        }
    }

    fn uniform_buffer(&mut self) -> BufferHandle {
        self.engine.create_buffer(BufferDescriptor {
            size: 256,
            usage: BufferUsage::UNIFORM,
        })
    }

    fn set_with(&mut self, buffer: BufferHandle) -> DescriptorSetHandle {
        let set = self.engine.create_descriptor_set(self.layout);
        self.engine.update_descriptor_set_buffer(set, 0, buffer, 0, 256);
        set
    }

    fn begin(&mut self) {
        self.engine.begin_render_pass(self.target, RenderPassParams::default());
        self.engine.bind_pipeline(PipelineState {
            program: self.program,
            raster: RasterState::default(),
        });
    }

    fn finish(&mut self) {
        self.engine.end_render_pass();
        assert_eq!(self.engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);
    }

    fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.probe.count(predicate)
    }
}

fn is_bind(call: &NativeCall) -> bool {
    matches!(call, NativeCall::BindSet { .. })
}

fn is_allocation(call: &NativeCall) -> bool {
    matches!(call, NativeCall::AllocateSet { .. })
}

#[test]
fn test_second_draw_binds_nothing_new() {
    let mut scene = Scene::new();
    let buffer = scene.uniform_buffer();
    let set = scene.set_with(buffer);

    scene.begin();
    scene.engine.bind_descriptor_set(0, set, Vec::new());
    scene.engine.draw(3, 1, 0);
    scene.engine.draw(3, 1, 0);
    scene.finish();

    assert_eq!(scene.count(is_allocation), 1);
    assert_eq!(scene.count(|c| matches!(c, NativeCall::WriteSet { .. })), 1);
    assert_eq!(scene.count(is_bind), 1);
    assert_eq!(scene.count(|c| matches!(c, NativeCall::Draw { .. })), 2);
}

#[test]
fn test_sets_with_equal_content_share_one_native_set() {
    let mut scene = Scene::new();
    let buffer = scene.uniform_buffer();
    let first = scene.set_with(buffer);
    let second = scene.set_with(buffer);

    scene.begin();
    scene.engine.bind_descriptor_set(0, first, Vec::new());
    scene.engine.draw(3, 1, 0);
    scene.engine.bind_descriptor_set(0, second, Vec::new());
    scene.engine.draw(3, 1, 0);
    scene.finish();

    assert_eq!(scene.count(is_allocation), 1);
    assert_eq!(scene.count(is_bind), 1, "same native set is already bound");

    let stats = scene.engine.get_stats();
    assert_eq!(stats.native_set_allocations, 1);
    assert!(stats.set_cache_hits >= 1);
    assert_eq!(stats.cached_sets, 1);
}

#[test]
fn test_changed_content_allocates_and_rebinds() {
    let mut scene = Scene::new();
    let first_buffer = scene.uniform_buffer();
    let second_buffer = scene.uniform_buffer();
    let set = scene.set_with(first_buffer);

    scene.begin();
    scene.engine.bind_descriptor_set(0, set, Vec::new());
    scene.engine.draw(3, 1, 0);
    scene
        .engine
        .update_descriptor_set_buffer(set, 0, second_buffer, 0, 256);
    scene.engine.draw(3, 1, 0);
    scene.finish();

    assert_eq!(scene.count(is_allocation), 2);
    assert_eq!(scene.count(is_bind), 2);

    // Switching back finds the first native set again.
    scene.probe.clear_calls();
    scene
        .engine
        .update_descriptor_set_buffer(set, 0, first_buffer, 0, 256);
    scene.begin();
    scene.engine.draw(3, 1, 0);
    scene.finish();
    assert_eq!(scene.count(is_allocation), 0);
    assert_eq!(scene.count(is_bind), 1);
}

#[test]
fn test_dynamic_offsets_change_forces_rebind() {
    init_test_logging();
    let (mut engine, probe) = Engine::headless(&StrandConfig::default()).expect("engine starts");

    let layout = engine.create_set_layout(SetLayoutDescriptor {
        bindings: vec![SetLayoutBinding {
            binding: 0,
            kind: BindingKind::DynamicUniformBuffer,
            stages: ShaderStages::VERTEX,
        }],
    });
    let program = engine.create_program(ProgramDescriptor {
        name: "instanced".to_string(),
        source: ShaderSource::Graphics {
            vertex: vec![SPIRV_MAGIC],
            fragment: vec![SPIRV_MAGIC],
        },
        set_layouts: vec![Some(layout)],
    });
    let buffer = engine.create_buffer(BufferDescriptor {
        size: 1024,
        usage: BufferUsage::UNIFORM,
    });
    let set = engine.create_descriptor_set(layout);
    engine.update_descriptor_set_buffer(set, 0, buffer, 0, 256);
    let color = engine.create_texture(TextureDescriptor::new_2d(
        TextureFormat::Rgba8,
        16,
        16,
        TextureUsage::COLOR_ATTACHMENT,
    ));
    let target = engine.create_render_target(RenderTargetDescriptor {
        width: 16,
        height: 16,
        color: vec![Attachment::new(color)],
        depth: None,
        samples: 1,
        layer_count: 1,
    });

    engine.begin_render_pass(target, RenderPassParams::default());
    engine.bind_pipeline(PipelineState {
        program,
        raster: RasterState::default(),
    });
    for offset in [0u32, 256, 256, 512] {
        engine.bind_descriptor_set(0, set, vec![offset]);
        engine.draw(3, 1, 0);
    }
    engine.end_render_pass();
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    let offsets: Vec<Vec<u32>> = probe
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::BindSet { offsets, .. } => Some(offsets),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![vec![0], vec![256], vec![512]]);
    assert_eq!(probe.count(is_allocation), 1);
}

#[test]
fn test_bindings_are_reapplied_after_submission() {
    let mut scene = Scene::new();
    let buffer = scene.uniform_buffer();
    let set = scene.set_with(buffer);

    for _ in 0..2 {
        scene.begin();
        scene.engine.bind_descriptor_set(0, set, Vec::new());
        scene.engine.draw(3, 1, 0);
        scene.finish();
    }

    assert_eq!(scene.count(is_allocation), 1);
    assert_eq!(scene.count(is_bind), 2, "each submission starts with nothing bound");
}

#[test]
fn test_draw_without_bound_set_loses_device() {
    let mut scene = Scene::new();

    scene.begin();
    scene.engine.draw(3, 1, 0);
    scene.engine.end_render_pass();
    assert_eq!(scene.engine.flush_and_wait(WAIT), FenceStatus::Error);
    assert_eq!(scene.count(|c| matches!(c, NativeCall::Draw { .. })), 0);
}

#[test]
fn test_compute_dispatch_commits_storage_bindings() {
    init_test_logging();
    let (mut engine, probe) = Engine::headless(&StrandConfig::default()).expect("engine starts");

    let layout = engine.create_set_layout(SetLayoutDescriptor {
        bindings: vec![SetLayoutBinding {
            binding: 0,
            kind: BindingKind::StorageBuffer,
            stages: ShaderStages::COMPUTE,
        }],
    });
    let program = engine.create_program(ProgramDescriptor {
        name: "reduce".to_string(),
        source: ShaderSource::Compute {
            compute: vec![SPIRV_MAGIC],
        },
        set_layouts: vec![Some(layout)],
    });
    let buffer = engine.create_buffer(BufferDescriptor {
        size: 4096,
        usage: BufferUsage::STORAGE,
    });
    let set = engine.create_descriptor_set(layout);
    engine.update_descriptor_set_buffer(set, 0, buffer, 0, 0);
    engine.bind_descriptor_set(0, set, Vec::new());
    engine.dispatch_compute(program, [16, 1, 1]);
    engine.dispatch_compute(program, [8, 8, 1]);
    assert_eq!(engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);

    assert_eq!(probe.count(|c| matches!(c, NativeCall::Dispatch { .. })), 2);
    assert_eq!(probe.count(is_bind), 1);
    assert!(probe
        .calls()
        .iter()
        .any(|c| matches!(c, NativeCall::Dispatch { groups: [8, 8, 1], .. })));
}

#[test]
#[should_panic(expected = "unsupported binding type")]
fn test_storage_layout_rejected_without_support() {
    init_test_logging();
    let (backend, probe) = HeadlessBackend::new();
    probe.set_storage_buffers(false);
    let mut engine =
        Engine::with_backend(move || Ok(backend), &StrandConfig::default()).expect("engine starts");
    assert!(!engine.capabilities().storage_buffers);

    engine.create_set_layout(SetLayoutDescriptor {
        bindings: vec![SetLayoutBinding {
            binding: 0,
            kind: BindingKind::StorageBuffer,
            stages: ShaderStages::COMPUTE,
        }],
    });
}

#[test]
fn test_clear_binding_history_waits_for_idle() {
    let mut scene = Scene::new();
    let buffer = scene.uniform_buffer();
    let set = scene.set_with(buffer);

    scene.begin();
    scene.engine.bind_descriptor_set(0, set, Vec::new());
    scene.engine.draw(3, 1, 0);
    scene.finish();

    scene.engine.clear_binding_history();
    assert_eq!(scene.engine.flush_and_wait(WAIT), FenceStatus::ConditionSatisfied);
    assert_eq!(scene.count(|c| *c == NativeCall::WaitIdle), 1);

    // History is gone: the content is written again into a pooled set.
    scene.probe.clear_calls();
    scene.begin();
    scene.engine.draw(3, 1, 0);
    scene.finish();
    assert_eq!(scene.count(is_allocation), 0);
    assert_eq!(scene.count(|c| matches!(c, NativeCall::WriteSet { .. })), 1);
    assert_eq!(scene.count(is_bind), 1);
}
