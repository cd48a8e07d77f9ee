//! Integration test: operation list and Dispatcher
//!
//! Drives the generated dispatch table with a driver that only records which
//! routine ran, and the generated encode stubs with an encoder that executes
//! commands immediately.
//!
//! Run with: cargo test -p strand-protocol --test dispatch_test

use std::collections::HashSet;

use crossbeam_channel::Receiver;
use strand_protocol::*;

#[derive(Default)]
struct RecordingDriver {
    log: Vec<String>,
}

impl RecordingDriver {
    fn note(&mut self, entry: impl Into<String>) {
        self.log.push(entry.into());
    }
}

impl DriverApi for RecordingDriver {
    fn create_texture(&mut self, handle: TextureHandle, descriptor: TextureDescriptor) {
        self.note(format!("create_texture {} {}x{}", handle.raw(), descriptor.width, descriptor.height));
    }
    fn update_texture(&mut self, _texture: TextureHandle, level: u8, _pixels: PixelBufferDescriptor) {
        self.note(format!("update_texture {level}"));
    }
    fn create_buffer(&mut self, _handle: BufferHandle, descriptor: BufferDescriptor) {
        self.note(format!("create_buffer {}", descriptor.size));
    }
    fn update_buffer(&mut self, _buffer: BufferHandle, offset: u64, data: Vec<u8>) {
        self.note(format!("update_buffer {offset} {}", data.len()));
    }
    fn create_set_layout(&mut self, _handle: SetLayoutHandle, _descriptor: SetLayoutDescriptor) {
        self.note("create_set_layout");
    }
    fn create_descriptor_set(&mut self, _handle: DescriptorSetHandle, _layout: SetLayoutHandle) {
        self.note("create_descriptor_set");
    }
    fn update_descriptor_set_buffer(
        &mut self,
        _set: DescriptorSetHandle,
        slot: u8,
        _buffer: BufferHandle,
        _offset: u64,
        _size: u64,
    ) {
        self.note(format!("update_descriptor_set_buffer {slot}"));
    }
    fn update_descriptor_set_texture(
        &mut self,
        _set: DescriptorSetHandle,
        slot: u8,
        _texture: TextureHandle,
        _sampler: SamplerParams,
    ) {
        self.note(format!("update_descriptor_set_texture {slot}"));
    }
    fn bind_descriptor_set(&mut self, index: u8, _set: DescriptorSetHandle, _offsets: Vec<u32>) {
        self.note(format!("bind_descriptor_set {index}"));
    }
    fn unbind_descriptor_set(&mut self, index: u8) {
        self.note(format!("unbind_descriptor_set {index}"));
    }
    fn create_program(&mut self, _handle: ProgramHandle, descriptor: ProgramDescriptor) {
        self.note(format!("create_program {}", descriptor.name));
    }
    fn create_render_target(&mut self, _handle: RenderTargetHandle, _descriptor: RenderTargetDescriptor) {
        self.note("create_render_target");
    }
    fn create_swap_chain(&mut self, _handle: SwapChainHandle, _descriptor: SwapChainDescriptor) {
        self.note("create_swap_chain");
    }
    fn create_swap_chain_render_target(&mut self, _handle: RenderTargetHandle, _swap_chain: SwapChainHandle) {
        self.note("create_swap_chain_render_target");
    }
    fn begin_frame(&mut self, _swap_chain: SwapChainHandle) {
        self.note("begin_frame");
    }
    fn end_frame(&mut self, _swap_chain: SwapChainHandle) {
        self.note("end_frame");
    }
    fn begin_render_pass(&mut self, _target: RenderTargetHandle, _params: RenderPassParams) {
        self.note("begin_render_pass");
    }
    fn end_render_pass(&mut self) {
        self.note("end_render_pass");
    }
    fn set_viewport(&mut self, viewport: Rect2D) {
        self.note(format!("set_viewport {}", viewport.y));
    }
    fn set_scissor(&mut self, _scissor: Rect2D) {
        self.note("set_scissor");
    }
    fn bind_pipeline(&mut self, _state: PipelineState) {
        self.note("bind_pipeline");
    }
    fn draw(&mut self, vertex_count: u32, _instance_count: u32, _first_vertex: u32) {
        self.note(format!("draw {vertex_count}"));
    }
    fn dispatch_compute(&mut self, _program: ProgramHandle, groups: [u32; 3]) {
        self.note(format!("dispatch_compute {}", groups[0]));
    }
    fn clear_binding_history(&mut self) {
        self.note("clear_binding_history");
    }
    fn clear_attachment_cache(&mut self) {
        self.note("clear_attachment_cache");
    }
    fn insert_event_marker(&mut self, label: String) {
        self.note(format!("marker {label}"));
    }
    fn get_capabilities(&mut self) -> Capabilities {
        self.note("get_capabilities");
        Capabilities {
            backend: "recording".to_string(),
            device_name: "none".to_string(),
            color_sample_counts: SampleCounts::S1,
            depth_sample_counts: SampleCounts::S1,
            storage_buffers: false,
            max_color_attachments: MAX_COLOR_ATTACHMENTS as u8,
            uniform_offset_alignment: 256,
        }
    }
    fn is_texture_format_supported(&mut self, format: TextureFormat, _usage: TextureUsage) -> bool {
        self.note("is_texture_format_supported");
        !format.is_depth()
    }
    fn get_stats(&mut self) -> DriverStats {
        self.note("get_stats");
        DriverStats {
            commands_executed: self.log.len() as u64,
            ..DriverStats::default()
        }
    }
}

/// Encoder that executes each command as soon as it is encoded.
struct ImmediateEncoder {
    dispatcher: Dispatcher<RecordingDriver>,
    driver: RecordingDriver,
}

impl CommandEncoder for ImmediateEncoder {
    fn encode(&mut self, command: Command) {
        self.dispatcher.dispatch(&mut self.driver, command);
    }

    fn await_reply<T>(&mut self, reply: Receiver<T>) -> T {
        match reply.try_recv() {
            Ok(value) => value,
            Err(e) => panic!("reply not produced: {e}"),
        }
    }
}

fn texture(index: u32) -> TextureHandle {
    TextureHandle::from_raw(RawHandle::new(index, 0))
}

#[test]
fn test_operation_table_is_consistent() {
    assert_eq!(OPERATIONS.len(), 29);
    for (tag, descriptor) in OPERATIONS.iter().enumerate() {
        assert_eq!(descriptor.op as usize, tag, "{} out of tag order", descriptor.name);
        assert_eq!(Op::from_raw(tag as u16), Some(descriptor.op));
    }
    assert_eq!(Op::from_raw(OPERATIONS.len() as u16), None);

    let names: HashSet<_> = OPERATIONS.iter().map(|d| d.name).collect();
    assert_eq!(names.len(), OPERATIONS.len(), "operation names must be unique");

    let sync: Vec<_> = OPERATIONS
        .iter()
        .filter(|d| d.kind == OpKind::Sync)
        .map(|d| d.name)
        .collect();
    assert_eq!(
        sync,
        vec!["get_capabilities", "is_texture_format_supported", "get_stats"]
    );

    assert_eq!(Op::Draw.descriptor().arity, 3);
    assert_eq!(Op::EndRenderPass.descriptor().arity, 0);
    assert_eq!(Op::UpdateDescriptorSetBuffer.descriptor().arity, 5);
}

#[test]
fn test_dispatcher_has_one_routine_per_operation() {
    let dispatcher = Dispatcher::<RecordingDriver>::new();
    assert_eq!(dispatcher.len(), OPERATIONS.len());
}

#[test]
fn test_dispatch_routes_by_tag() {
    let dispatcher = Dispatcher::<RecordingDriver>::new();
    let mut driver = RecordingDriver::default();

    dispatcher.dispatch(&mut driver, Command::InsertEventMarker { label: "a".to_string() });
    dispatcher.dispatch(
        &mut driver,
        Command::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
        },
    );
    dispatcher.dispatch(&mut driver, Command::EndRenderPass {});

    assert_eq!(driver.log, vec!["marker a", "draw 3", "end_render_pass"]);
}

#[test]
fn test_encoder_stubs_preserve_order() {
    let mut encoder = ImmediateEncoder {
        dispatcher: Dispatcher::new(),
        driver: RecordingDriver::default(),
    };
    for i in 0..5 {
        encoder.insert_event_marker(format!("m{i}"));
    }
    assert_eq!(encoder.driver.log, vec!["marker m0", "marker m1", "marker m2", "marker m3", "marker m4"]);
}

#[test]
fn test_sync_stub_returns_driver_result() {
    let mut encoder = ImmediateEncoder {
        dispatcher: Dispatcher::new(),
        driver: RecordingDriver::default(),
    };
    encoder.insert_event_marker("before".to_string());
    let stats = encoder.get_stats();
    assert_eq!(stats.commands_executed, 2);
    assert!(encoder.is_texture_format_supported(TextureFormat::Rgba8, TextureUsage::SAMPLEABLE));
    assert!(!encoder.is_texture_format_supported(TextureFormat::Depth32F, TextureUsage::SAMPLEABLE));
    assert_eq!(encoder.get_capabilities().backend, "recording");
}

#[test]
fn test_command_visits_every_handle() {
    let command = Command::CreateRenderTarget {
        handle: RenderTargetHandle::from_raw(RawHandle::new(9, 1)),
        descriptor: RenderTargetDescriptor {
            width: 64,
            height: 64,
            color: vec![Attachment::new(texture(1)), Attachment::new(texture(2))],
            depth: Some(Attachment::new(texture(3))),
            samples: 1,
            layer_count: 1,
        },
    };
    let mut seen = Vec::new();
    command.visit_handles(&mut |raw| seen.push(raw.index));
    assert_eq!(seen, vec![9, 1, 2, 3]);
    assert_eq!(command.op(), Op::CreateRenderTarget);
    assert_eq!(command.op().name(), "create_render_target");
}

#[test]
#[should_panic(expected = "unknown operation tag")]
fn test_unknown_tag_is_fatal() {
    let dispatcher = Dispatcher::<RecordingDriver>::new();
    let _ = dispatcher.routine(OPERATIONS.len() as u16);
}

#[test]
#[should_panic(expected = "corrupt command stream")]
fn test_mismatched_routine_is_fatal() {
    let dispatcher = Dispatcher::<RecordingDriver>::new();
    let mut driver = RecordingDriver::default();
    let draw = dispatcher.routine(Op::Draw as u16);
    draw(&mut driver, Command::EndRenderPass {});
}
