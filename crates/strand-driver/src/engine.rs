//! Client-side façade: creates resources, records commands and waits.
//!
//! An `Engine` lives on one client thread. Every call records into the
//! current command buffer and returns immediately, except the synchronous
//! queries and `flush_and_wait`.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use strand_core::config::BackendKind;
use strand_core::{DescriptorSetDescriptor, FenceStatus, ResourceArena, StrandConfig, Timeline};
use strand_protocol::{
    BufferDescriptor, BufferHandle, Capabilities, CommandEncoder, DescriptorSetHandle,
    DriverStats, LayoutMask, PipelineState, PixelBufferDescriptor, ProgramDescriptor,
    ProgramHandle, ProtocolError, Rect2D, RenderPassParams, RenderTargetDescriptor,
    RenderTargetHandle, SamplerParams, SetLayoutDescriptor, SetLayoutHandle, SwapChainDescriptor,
    SwapChainHandle, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
};
use tracing::{error, info};

use crate::attachments::validate_render_target;
use crate::backend::Backend;
use crate::backends::headless::{HeadlessBackend, HeadlessProbe};
use crate::backends::vulkan::VulkanBackend;
use crate::error::{BackendError, DriverError};
use crate::executor;
use crate::queue::CommandBufferQueue;
use crate::stream::CommandStream;

pub struct Engine {
    stream: CommandStream,
    arena: Arc<ResourceArena>,
    timeline: Arc<Timeline>,
    queue: Arc<CommandBufferQueue>,
    thread: Option<JoinHandle<()>>,
    capabilities: Capabilities,
}

impl Engine {
    /// Starts the backend selected by `config.backend.kind`.
    pub fn new(config: &StrandConfig) -> Result<Self, DriverError> {
        match config.backend.kind {
            BackendKind::Headless => {
                let (backend, _probe) = HeadlessBackend::new();
                Self::with_backend(move || Ok(backend), config)
            }
            BackendKind::Vulkan => {
                let backend_config = config.backend.clone();
                let sets_per_pool = config.bindings.sets_per_pool;
                Self::with_backend(
                    move || VulkanBackend::new(&backend_config, sets_per_pool),
                    config,
                )
            }
        }
    }

    /// Starts a headless engine and returns the probe observing its backend.
    pub fn headless(config: &StrandConfig) -> Result<(Self, HeadlessProbe), DriverError> {
        let (backend, probe) = HeadlessBackend::new();
        Ok((Self::with_backend(move || Ok(backend), config)?, probe))
    }

    /// Starts the execution thread with a backend built on that thread.
    pub fn with_backend<B, F>(factory: F, config: &StrandConfig) -> Result<Self, DriverError>
    where
        B: Backend,
        F: FnOnce() -> Result<B, BackendError> + Send + 'static,
    {
        let arena = Arc::new(ResourceArena::new());
        let timeline = Arc::new(Timeline::new());
        let (queue, receiver) = CommandBufferQueue::new(config.engine.queue_depth);
        if config.engine.start_paused {
            queue.set_paused(true);
        }

        let (thread, capabilities) =
            executor::spawn(factory, arena.clone(), timeline.clone(), receiver, config)?;
        info!(
            "engine started on {} ({}), queue depth {}",
            capabilities.backend, capabilities.device_name, config.engine.queue_depth
        );

        let stream = CommandStream::new(
            arena.clone(),
            queue.clone(),
            config.engine.command_buffer_capacity,
        );
        Ok(Self {
            stream,
            arena,
            timeline,
            queue,
            thread: Some(thread),
            capabilities,
        })
    }

    /// Capabilities reported by the backend at start-up.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    pub fn queue(&self) -> &CommandBufferQueue {
        &self.queue
    }

    // ── Textures and buffers ────────────────────────────────

    pub fn create_texture(&mut self, descriptor: TextureDescriptor) -> TextureHandle {
        let handle = self.arena.create(descriptor.clone());
        self.stream.create_texture(handle, descriptor);
        handle
    }

    pub fn destroy_texture(&mut self, texture: TextureHandle) {
        self.arena.release(texture.raw());
    }

    /// Uploads pixels into one level. The pixel buffer is validated here so
    /// a malformed upload fails on the caller's thread.
    pub fn update_texture(
        &mut self,
        texture: TextureHandle,
        level: u8,
        pixels: PixelBufferDescriptor,
    ) -> Result<(), ProtocolError> {
        let descriptor = self.arena.texture_descriptor(texture);
        if level >= descriptor.levels {
            error!(
                "texture {} has {} levels, upload targets level {}",
                texture.raw(),
                descriptor.levels,
                level
            );
            panic!("texture upload to level {level} of a {}-level texture", descriptor.levels);
        }
        let width = (descriptor.width >> level).max(1);
        let height = (descriptor.height >> level).max(1);
        pixels.validate(width, height)?;
        self.stream.update_texture(texture, level, pixels);
        Ok(())
    }

    pub fn create_buffer(&mut self, descriptor: BufferDescriptor) -> BufferHandle {
        let handle = self.arena.create(descriptor.clone());
        self.stream.create_buffer(handle, descriptor);
        handle
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.arena.release(buffer.raw());
    }

    pub fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: Vec<u8>) {
        self.stream.update_buffer(buffer, offset, data);
    }

    /// Uploads plain-old-data values, e.g. a uniform block struct.
    pub fn update_buffer_pod<T: bytemuck::Pod>(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        values: &[T],
    ) {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.stream.update_buffer(buffer, offset, bytes.to_vec());
    }

    // ── Bindings ────────────────────────────────────────────

    /// Registers a descriptor-set layout. Binding kinds the backend cannot
    /// express are rejected immediately.
    pub fn create_set_layout(&mut self, descriptor: SetLayoutDescriptor) -> SetLayoutHandle {
        let mask = LayoutMask::from_descriptor(&descriptor);
        if mask.storage != 0 && !self.capabilities.storage_buffers {
            error!(
                "set layout declares storage buffers, unsupported by {}",
                self.capabilities.backend
            );
            panic!(
                "unsupported binding type: {} has no storage buffer support",
                self.capabilities.backend
            );
        }
        let handle = self.arena.create(descriptor.clone());
        self.stream.create_set_layout(handle, descriptor);
        handle
    }

    pub fn destroy_set_layout(&mut self, layout: SetLayoutHandle) {
        self.arena.release(layout.raw());
    }

    pub fn create_descriptor_set(&mut self, layout: SetLayoutHandle) -> DescriptorSetHandle {
        let handle = self.arena.create(DescriptorSetDescriptor { layout });
        self.stream.create_descriptor_set(handle, layout);
        handle
    }

    pub fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) {
        self.arena.release(set.raw());
    }

    pub fn update_descriptor_set_buffer(
        &mut self,
        set: DescriptorSetHandle,
        slot: u8,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) {
        self.stream
            .update_descriptor_set_buffer(set, slot, buffer, offset, size);
    }

    pub fn update_descriptor_set_texture(
        &mut self,
        set: DescriptorSetHandle,
        slot: u8,
        texture: TextureHandle,
        sampler: SamplerParams,
    ) {
        self.stream
            .update_descriptor_set_texture(set, slot, texture, sampler);
    }

    pub fn bind_descriptor_set(&mut self, index: u8, set: DescriptorSetHandle, offsets: Vec<u32>) {
        self.stream.bind_descriptor_set(index, set, offsets);
    }

    pub fn unbind_descriptor_set(&mut self, index: u8) {
        self.stream.unbind_descriptor_set(index);
    }

    pub fn clear_binding_history(&mut self) {
        self.stream.clear_binding_history();
    }

    // ── Programs, targets, swap chains ──────────────────────

    pub fn create_program(&mut self, descriptor: ProgramDescriptor) -> ProgramHandle {
        let handle = self.arena.create(descriptor.clone());
        self.stream.create_program(handle, descriptor);
        handle
    }

    pub fn destroy_program(&mut self, program: ProgramHandle) {
        self.arena.release(program.raw());
    }

    pub fn create_render_target(&mut self, descriptor: RenderTargetDescriptor) -> RenderTargetHandle {
        validate_render_target(&descriptor);
        let handle = self.arena.create(descriptor.clone());
        self.stream.create_render_target(handle, descriptor);
        handle
    }

    pub fn destroy_render_target(&mut self, target: RenderTargetHandle) {
        self.arena.release(target.raw());
    }

    pub fn create_swap_chain(&mut self, descriptor: SwapChainDescriptor) -> SwapChainHandle {
        let handle = self.arena.create(descriptor.clone());
        self.stream.create_swap_chain(handle, descriptor);
        handle
    }

    pub fn destroy_swap_chain(&mut self, swap_chain: SwapChainHandle) {
        self.arena.release(swap_chain.raw());
    }

    /// Render target drawing into whichever image `begin_frame` acquired.
    pub fn create_swap_chain_render_target(&mut self, swap_chain: SwapChainHandle) -> RenderTargetHandle {
        let handle = self.arena.create(swap_chain);
        self.stream.create_swap_chain_render_target(handle, swap_chain);
        handle
    }

    pub fn begin_frame(&mut self, swap_chain: SwapChainHandle) {
        self.stream.begin_frame(swap_chain);
    }

    pub fn end_frame(&mut self, swap_chain: SwapChainHandle) {
        self.stream.end_frame(swap_chain);
    }

    pub fn clear_attachment_cache(&mut self) {
        self.stream.clear_attachment_cache();
    }

    // ── Passes and work ─────────────────────────────────────

    pub fn begin_render_pass(&mut self, target: RenderTargetHandle, params: RenderPassParams) {
        self.stream.begin_render_pass(target, params);
    }

    pub fn end_render_pass(&mut self) {
        self.stream.end_render_pass();
    }

    pub fn set_viewport(&mut self, viewport: Rect2D) {
        self.stream.set_viewport(viewport);
    }

    pub fn set_scissor(&mut self, scissor: Rect2D) {
        self.stream.set_scissor(scissor);
    }

    pub fn bind_pipeline(&mut self, state: PipelineState) {
        self.stream.bind_pipeline(state);
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        self.stream.draw(vertex_count, instance_count, first_vertex);
    }

    pub fn dispatch_compute(&mut self, program: ProgramHandle, groups: [u32; 3]) {
        self.stream.dispatch_compute(program, groups);
    }

    pub fn insert_event_marker(&mut self, label: impl Into<String>) {
        self.stream.insert_event_marker(label.into());
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn get_capabilities(&mut self) -> Capabilities {
        self.stream.get_capabilities()
    }

    pub fn is_texture_format_supported(&mut self, format: TextureFormat, usage: TextureUsage) -> bool {
        self.stream.is_texture_format_supported(format, usage)
    }

    pub fn get_stats(&mut self) -> DriverStats {
        self.stream.get_stats()
    }

    // ── Synchronization ─────────────────────────────────────

    /// Hands the current buffer to the execution thread. Returns the
    /// sequence number covering everything recorded so far.
    pub fn flush(&mut self) -> u64 {
        self.stream.flush()
    }

    /// Flushes and blocks until everything recorded so far has retired.
    /// `None` waits forever.
    pub fn flush_and_wait(&mut self, timeout: Option<Duration>) -> FenceStatus {
        let seq = self.flush();
        if seq == 0 {
            return FenceStatus::ConditionSatisfied;
        }
        self.timeline.wait(seq, timeout)
    }

    /// Highest retired command buffer.
    pub fn retired(&self) -> u64 {
        self.timeline.retired()
    }

    pub fn is_device_lost(&self) -> bool {
        self.timeline.is_device_lost()
    }

    /// Device-lost as an error, for callers that propagate with `?`.
    pub fn check_device(&self) -> Result<(), DriverError> {
        if self.is_device_lost() {
            Err(DriverError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Holds submitted buffers on the queue without executing them.
    pub fn set_paused(&self, paused: bool) {
        self.queue.set_paused(paused);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let executor_alive = !self.timeline.is_device_lost();
        if !std::thread::panicking() && executor_alive && self.stream.pending_commands() > 0 {
            self.stream.flush();
        }
        self.queue.request_exit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("execution thread panicked");
            }
        }
        info!("engine stopped");
    }
}
