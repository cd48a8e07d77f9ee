//! The generic driver: executes every operation against a concrete backend.
//!
//! `CoreDriver<B>` owns all native objects and runs only on the execution
//! thread. It resolves handles through the shared arena, keeps native
//! bindings and attachments in their caches, tracks image layouts and
//! destroys native objects once the arena reports them retired.

use std::collections::HashMap;
use std::sync::Arc;

use strand_core::config::{AcquireFailurePolicy, DeviceErrorPolicy, PolicyConfig};
use strand_core::coords::{clamp_scissor, flip_viewport};
use strand_core::{ImageLayout, ResourceArena, Retired, Timeline};
use strand_protocol::{
    BufferDescriptor, BufferHandle, Capabilities, DescriptorSetHandle, DriverApi, DriverStats,
    LayoutMask, PipelineState, PixelBufferDescriptor, ProgramDescriptor, ProgramHandle,
    RawHandle, Rect2D, RenderPassParams, RenderTargetDescriptor, RenderTargetHandle,
    ResourceKind, SamplerParams, SetLayoutDescriptor, SetLayoutHandle, SwapChainDescriptor,
    SwapChainHandle, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
};
use tracing::{debug, error, info, trace, warn};

use crate::attachments::{self, AttachmentSet, FramebufferImage, FramebufferKey};
use crate::backend::{Backend, FramebufferAttachment, RenderPassKey};
use crate::binding_cache::{BindingCache, SlotContent};
use crate::error::BackendError;

// ── Native objects ──────────────────────────────────────────

pub struct NativeTexture<B: Backend> {
    pub native: B::Texture,
    pub descriptor: TextureDescriptor,
}

pub struct NativeProgram<B: Backend> {
    pub native: B::Program,
    pub set_mask: u8,
    pub compute: bool,
}

pub struct NativeBuffer<B: Backend> {
    pub native: B::Buffer,
    pub size: u64,
}

/// Native objects keyed by the handle of the resource they back.
pub struct NativeResources<B: Backend> {
    textures: HashMap<RawHandle, NativeTexture<B>>,
    buffers: HashMap<RawHandle, NativeBuffer<B>>,
    samplers: HashMap<SamplerParams, B::Sampler>,
    programs: HashMap<RawHandle, NativeProgram<B>>,
}

impl<B: Backend> Default for NativeResources<B> {
    fn default() -> Self {
        Self {
            textures: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
        }
    }
}

#[cold]
#[inline(never)]
fn missing(kind: &str, handle: RawHandle) -> ! {
    error!("no native {} for {}", kind, handle);
    panic!("{handle} has no native {kind}: it was never created or already destroyed");
}

impl<B: Backend> NativeResources<B> {
    pub fn texture(&self, handle: RawHandle) -> (&B::Texture, TextureFormat) {
        let entry = self.texture_entry(handle);
        (&entry.native, entry.descriptor.format)
    }

    pub fn texture_entry(&self, handle: RawHandle) -> &NativeTexture<B> {
        match self.textures.get(&handle) {
            Some(entry) => entry,
            None => missing("texture", handle),
        }
    }

    pub fn buffer(&self, handle: RawHandle) -> &B::Buffer {
        match self.buffers.get(&handle) {
            Some(entry) => &entry.native,
            None => missing("buffer", handle),
        }
    }

    pub fn sampler(&self, params: &SamplerParams) -> &B::Sampler {
        match self.samplers.get(params) {
            Some(sampler) => sampler,
            None => panic!("sampler {params:?} was never created"),
        }
    }

    pub fn program(&self, handle: RawHandle) -> &NativeProgram<B> {
        match self.programs.get(&handle) {
            Some(program) => program,
            None => missing("program", handle),
        }
    }
}

fn framebuffer_attachments<'a, B: Backend>(
    natives: &'a NativeResources<B>,
    images: &[FramebufferImage],
) -> Vec<FramebufferAttachment<'a, B>> {
    images
        .iter()
        .filter_map(|image| match *image {
            FramebufferImage::Texture {
                texture,
                level,
                layer,
            } => {
                let entry = natives.texture_entry(texture);
                Some(FramebufferAttachment {
                    texture: &entry.native,
                    descriptor: &entry.descriptor,
                    level,
                    layer,
                })
            }
            FramebufferImage::SwapChainImage { .. } => None,
        })
        .collect()
}

// ── Execution state ─────────────────────────────────────────

struct SwapChainState<B: Backend> {
    native: B::SwapChain,
    /// Descriptor shared by every image of the chain.
    image: TextureDescriptor,
    layouts: Vec<ImageLayout>,
    acquired: Option<u32>,
    /// Acquisition failed and the frame is being dropped.
    skipping: bool,
}

#[derive(Clone)]
enum TargetState {
    Offscreen(AttachmentSet),
    SwapChain(RawHandle),
}

enum PassFramebuffer<B: Backend> {
    Cached(FramebufferKey),
    Transient {
        framebuffer: B::Framebuffer,
        swap_chain: RawHandle,
        image: u32,
    },
    /// Swap-chain pass of a skipped frame; nothing reaches the backend.
    Skipped,
}

struct ActivePass<B: Backend> {
    target: RawHandle,
    key: RenderPassKey,
    framebuffer: PassFramebuffer<B>,
    width: u32,
    height: u32,
}

impl<B: Backend> ActivePass<B> {
    fn is_skipped(&self) -> bool {
        matches!(self.framebuffer, PassFramebuffer::Skipped)
    }
}

fn expect_pass<'a, B: Backend>(pass: &'a Option<ActivePass<B>>, operation: &str) -> &'a ActivePass<B> {
    match pass {
        Some(pass) => pass,
        None => {
            error!("{} issued outside a render pass", operation);
            panic!("{operation} requires an active render pass");
        }
    }
}

pub struct CoreDriver<B: Backend> {
    backend: B,
    arena: Arc<ResourceArena>,
    timeline: Arc<Timeline>,
    policy: PolicyConfig,
    capabilities: Capabilities,
    natives: NativeResources<B>,
    swap_chains: HashMap<RawHandle, SwapChainState<B>>,
    targets: HashMap<RawHandle, TargetState>,
    bindings: BindingCache<B>,
    attachments: attachments::AttachmentCache<B>,
    pass: Option<ActivePass<B>>,
    pipeline: Option<RawHandle>,
    /// Textures left with a declared final layout by an ended pass.
    declared: Vec<RawHandle>,
    stats: DriverStats,
    device_lost: bool,
    /// Buffer being executed.
    seq: u64,
    /// Last buffer handed to the backend's queue.
    submitted: u64,
}

impl<B: Backend> CoreDriver<B> {
    pub fn new(
        backend: B,
        arena: Arc<ResourceArena>,
        timeline: Arc<Timeline>,
        policy: PolicyConfig,
        set_cache_capacity: usize,
    ) -> Self {
        let capabilities = backend.capabilities();
        info!(
            "{} driver ready on {} (color samples {:?}, depth samples {:?})",
            backend.name(),
            capabilities.device_name,
            capabilities.color_sample_counts,
            capabilities.depth_sample_counts
        );
        Self {
            backend,
            arena,
            timeline,
            policy,
            capabilities,
            natives: NativeResources::default(),
            swap_chains: HashMap::new(),
            targets: HashMap::new(),
            bindings: BindingCache::new(set_cache_capacity),
            attachments: attachments::AttachmentCache::new(),
            pass: None,
            pipeline: None,
            declared: Vec::new(),
            stats: DriverStats::default(),
            device_lost: false,
            seq: 0,
            submitted: 0,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    /// Whether submitted GPU work may still be outstanding.
    pub fn has_work_in_flight(&self) -> bool {
        self.timeline.retired() < self.submitted
    }

    // ── Buffer lifecycle ────────────────────────────────────

    pub fn begin_buffer(&mut self, seq: u64) {
        trace!("executing command buffer {}", seq);
        self.seq = seq;
    }

    pub fn command_executed(&mut self) {
        self.stats.commands_executed += 1;
    }

    /// Submits the buffer's native work. A buffer that ends inside a render
    /// pass keeps recording into the same native submission.
    pub fn end_buffer(&mut self, seq: u64) {
        self.stats.buffers_executed += 1;
        if self.pass.is_some() {
            trace!("buffer {} ends inside a render pass, submission deferred", seq);
            return;
        }
        self.submit_recorded();
    }

    fn submit_recorded(&mut self) {
        if self.device_lost {
            self.submitted = self.seq;
            return;
        }
        if let Err(e) = self.backend.submit(self.seq) {
            self.device_fault("submit", e);
        }
        self.submitted = self.seq;
        self.bindings.reset_bound_snapshot();
    }

    /// Destroys whatever retired and publishes the new frontier.
    pub fn retire(&mut self) {
        let frontier = if self.device_lost {
            self.seq
        } else {
            match self.backend.retired() {
                Ok(frontier) => frontier,
                Err(e) => {
                    self.device_fault("retirement query", e);
                    self.seq
                }
            }
        };

        let retired = self.arena.collect(frontier);
        for resource in &retired {
            match resource.kind {
                ResourceKind::Texture => {
                    self.bindings.evict_resource(resource.handle);
                    self.attachments.evict_texture(resource.handle);
                }
                ResourceKind::Buffer => self.bindings.evict_resource(resource.handle),
                _ => {}
            }
        }
        self.bindings.retire(frontier);
        self.attachments.retire(&mut self.backend, frontier);
        for resource in retired {
            self.destroy_native(resource);
        }
        self.timeline.advance(frontier);
    }

    fn destroy_native(&mut self, resource: Retired) {
        let handle = resource.handle;
        debug!("destroying native {:?} {}", resource.kind, handle);
        match resource.kind {
            ResourceKind::Texture => {
                if let Some(texture) = self.natives.textures.remove(&handle) {
                    self.backend.destroy_texture(texture.native);
                }
            }
            ResourceKind::Buffer => {
                if let Some(buffer) = self.natives.buffers.remove(&handle) {
                    self.backend.destroy_buffer(buffer.native);
                }
            }
            ResourceKind::SetLayout => {
                if let Some(layout) = self.bindings.remove_layout(handle) {
                    self.backend.destroy_set_layout(layout);
                }
            }
            ResourceKind::DescriptorSet => self.bindings.remove_set(handle),
            ResourceKind::Program => {
                if let Some(program) = self.natives.programs.remove(&handle) {
                    self.backend.destroy_program(program.native);
                }
            }
            ResourceKind::RenderTarget => {
                self.targets.remove(&handle);
            }
            ResourceKind::SwapChain => {
                if let Some(swap_chain) = self.swap_chains.remove(&handle) {
                    self.backend.destroy_swap_chain(swap_chain.native);
                }
            }
        }
        self.stats.resources_destroyed += 1;
    }

    /// Waits for the device and destroys every native object.
    pub fn shutdown(&mut self) {
        if self.pass.is_some() {
            warn!("shutting down inside a render pass");
            self.backend.end_render_pass();
            self.pass = None;
        }
        if !self.device_lost && self.submitted < self.seq {
            self.submit_recorded();
        }
        if let Err(e) = self.backend.wait_idle() {
            warn!("wait for device idle failed during shutdown: {}", e);
        }

        self.attachments.drain(&mut self.backend);
        for layout in self.bindings.drain_layouts() {
            self.backend.destroy_set_layout(layout);
        }
        for (_, program) in self.natives.programs.drain() {
            self.backend.destroy_program(program.native);
        }
        for (_, sampler) in self.natives.samplers.drain() {
            self.backend.destroy_sampler(sampler);
        }
        for (_, buffer) in self.natives.buffers.drain() {
            self.backend.destroy_buffer(buffer.native);
        }
        for (_, texture) in self.natives.textures.drain() {
            self.backend.destroy_texture(texture.native);
        }
        for (_, swap_chain) in self.swap_chains.drain() {
            self.backend.destroy_swap_chain(swap_chain.native);
        }
        self.targets.clear();
        self.timeline.advance(self.seq);
        info!(
            "{} driver stopped after {} command buffers",
            self.backend.name(),
            self.stats.buffers_executed
        );
    }

    // ── Faults ──────────────────────────────────────────────

    /// Applies the device-error policy to a failed native operation.
    fn device_fault(&mut self, what: &str, err: BackendError) {
        match self.policy.device_error {
            DeviceErrorPolicy::Panic => {
                error!("{} failed: {}", what, err);
                panic!("{what} failed: {err}");
            }
            DeviceErrorPolicy::ReportDeviceLost => {
                if !self.device_lost {
                    warn!("{} failed: {}; device is lost, dropping further work", what, err);
                    self.device_lost = true;
                    self.timeline.mark_device_lost();
                }
            }
        }
    }

    fn require_no_pass(&self, operation: &str) {
        if let Some(pass) = &self.pass {
            error!("{} issued while render pass on {} is active", operation, pass.target);
            panic!("{operation} is not allowed inside a render pass");
        }
    }

    // ── Layouts ─────────────────────────────────────────────

    /// Moves a texture to `to`, emitting a barrier only when it is elsewhere.
    /// Any declared final layout is dropped.
    fn transition(&mut self, texture: RawHandle, to: ImageLayout) {
        let from = self
            .arena
            .with_texture(TextureHandle::from_raw(texture), |_, state| {
                let from = state.layout;
                state.layout = to;
                state.declared = None;
                from
            });
        if from == to {
            return;
        }
        let entry = self.natives.texture_entry(texture);
        self.backend
            .transition(&entry.native, &entry.descriptor, from, to);
        self.stats.layout_transitions += 1;
        trace!("texture {} {:?} -> {:?}", texture, from, to);
    }

    fn transition_swap_chain_image(&mut self, swap_chain: RawHandle, index: u32, to: ImageLayout) {
        let Some(state) = self.swap_chains.get_mut(&swap_chain) else {
            missing("swap chain", swap_chain);
        };
        let from = state.layouts[index as usize];
        if from == to {
            return;
        }
        state.layouts[index as usize] = to;
        let image = self.backend.swap_chain_image(&state.native, index);
        self.backend.transition(image, &state.image, from, to);
        self.stats.layout_transitions += 1;
    }

    /// Applies declared final layouts of textures sampled through `sets`.
    /// Inside a render pass everything else was settled when the pass began,
    /// so a pending texture here is an attachment of the active pass.
    fn settle_sampled(&mut self, sets: &[RawHandle]) {
        for &set in sets {
            for texture in self.bindings.sampled_textures(set) {
                let pending = self
                    .arena
                    .with_texture(TextureHandle::from_raw(texture), |_, state| {
                        state.declared.filter(|declared| *declared != state.layout)
                    });
                let Some(declared) = pending else {
                    continue;
                };
                if let Some(pass) = &self.pass {
                    error!(
                        "texture {} sampled through set {} as {:?} while attached to the pass on {}",
                        texture, set, declared, pass.target
                    );
                    panic!(
                        "texture {texture} is sampled while it is an attachment of the active \
                         render pass"
                    );
                }
                self.transition(texture, declared);
            }
        }
    }

    /// Applies every declared final layout still pending, except on the
    /// textures `target` is about to render into. Nothing may transition
    /// once the pass has begun.
    fn settle_declared(&mut self, target: &TargetState) {
        if self.declared.is_empty() {
            return;
        }
        let attached: Vec<RawHandle> = match target {
            TargetState::Offscreen(set) => set
                .colors
                .iter()
                .chain(set.depth.iter())
                .map(|a| a.base.texture.raw())
                .collect(),
            TargetState::SwapChain(_) => Vec::new(),
        };
        for texture in std::mem::take(&mut self.declared) {
            if attached.contains(&texture) || !self.arena.is_live(texture) {
                continue;
            }
            let pending = self
                .arena
                .with_texture(TextureHandle::from_raw(texture), |_, state| {
                    state.declared.filter(|declared| *declared != state.layout)
                });
            if let Some(declared) = pending {
                self.transition(texture, declared);
            }
        }
    }

    // ── Binding commit ──────────────────────────────────────

    fn commit(&mut self, program: RawHandle) -> bool {
        let set_mask = self.natives.program(program).set_mask;
        let sets = self.bindings.bound_sets(set_mask);
        self.settle_sampled(&sets);

        let frontier = self.timeline.retired();
        let native = &self.natives.program(program).native;
        let result = self.bindings.commit(
            &mut self.backend,
            &self.natives,
            program,
            native,
            set_mask,
            self.seq,
            frontier,
        );
        match result {
            Ok(()) => true,
            Err(e) => {
                self.device_fault("descriptor set allocation", e);
                false
            }
        }
    }

    // ── Render passes ───────────────────────────────────────

    fn begin_offscreen_pass(
        &mut self,
        target: RawHandle,
        set: &AttachmentSet,
        params: &RenderPassParams,
    ) -> Option<ActivePass<B>> {
        let key = set.key(params);
        let pass_id = match self.attachments.ensure_pass(&mut self.backend, &key, self.seq) {
            Ok(id) => id,
            Err(e) => {
                self.device_fault("render pass creation", e);
                return None;
            }
        };

        for color in &set.colors {
            self.transition(color.rendered().raw(), ImageLayout::ColorAttachment);
            if color.sidecar.is_some() {
                self.transition(color.base.texture.raw(), ImageLayout::ColorAttachment);
            }
        }
        if let Some(depth) = &set.depth {
            self.transition(depth.rendered().raw(), ImageLayout::DepthAttachment);
        }

        let fb_key = FramebufferKey {
            pass: pass_id,
            width: set.width,
            height: set.height,
            layers: set.layer_count as u32,
            images: set.images(),
        };
        let images = framebuffer_attachments(&self.natives, &fb_key.images);
        if let Err(e) = self.attachments.ensure_framebuffer(
            &mut self.backend,
            &key,
            &fb_key,
            &images,
            self.seq,
        ) {
            self.device_fault("framebuffer creation", e);
            return None;
        }

        if let (Some(pass), Some(framebuffer)) =
            (self.attachments.pass(&key), self.attachments.framebuffer(&fb_key))
        {
            self.backend
                .begin_render_pass(pass, framebuffer, &key, params, set.width, set.height);
        }
        Some(ActivePass {
            target,
            key,
            framebuffer: PassFramebuffer::Cached(fb_key),
            width: set.width,
            height: set.height,
        })
    }

    fn begin_swap_chain_pass(
        &mut self,
        target: RawHandle,
        swap_chain: RawHandle,
        params: &RenderPassParams,
    ) -> Option<ActivePass<B>> {
        let Some(state) = self.swap_chains.get(&swap_chain) else {
            missing("swap chain", swap_chain);
        };
        let (width, height) = (state.image.width, state.image.height);
        let key = RenderPassKey {
            colors: vec![state.image.format],
            depth: None,
            samples: 1,
            resolve: 0,
            clear: params.clear,
            discard_start: params.discard_start,
            discard_end: params.discard_end,
            layer_count: 1,
        };
        if state.skipping {
            debug!("skipping render pass on swap chain {}", swap_chain);
            return Some(ActivePass {
                target,
                key,
                framebuffer: PassFramebuffer::Skipped,
                width,
                height,
            });
        }
        let Some(index) = state.acquired else {
            error!("render pass on swap chain {} without begin_frame", swap_chain);
            panic!("swap chain {swap_chain} has no acquired image; call begin_frame first");
        };

        if let Err(e) = self.attachments.ensure_pass(&mut self.backend, &key, self.seq) {
            self.device_fault("render pass creation", e);
            return None;
        }
        self.transition_swap_chain_image(swap_chain, index, ImageLayout::ColorAttachment);

        let Some(state) = self.swap_chains.get(&swap_chain) else {
            missing("swap chain", swap_chain);
        };
        let Some(pass) = self.attachments.pass(&key) else {
            return None;
        };
        let image = FramebufferAttachment::<B> {
            texture: self.backend.swap_chain_image(&state.native, index),
            descriptor: &state.image,
            level: 0,
            layer: 0,
        };
        let framebuffer = match self
            .backend
            .create_framebuffer(pass, &[image], width, height, 1)
        {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                self.device_fault("framebuffer creation", e);
                return None;
            }
        };
        self.backend
            .begin_render_pass(pass, &framebuffer, &key, params, width, height);
        Some(ActivePass {
            target,
            key,
            framebuffer: PassFramebuffer::Transient {
                framebuffer,
                swap_chain,
                image: index,
            },
            width,
            height,
        })
    }

    fn target_state(&self, target: RawHandle) -> TargetState {
        match self.targets.get(&target) {
            Some(state) => state.clone(),
            None => missing("render target", target),
        }
    }

    fn create_native_texture(&mut self, handle: RawHandle, descriptor: TextureDescriptor) {
        match self.backend.create_texture(&descriptor) {
            Ok(native) => {
                debug!(
                    "texture {} created: {:?} {}x{} x{}",
                    handle, descriptor.format, descriptor.width, descriptor.height, descriptor.samples
                );
                self.natives
                    .textures
                    .insert(handle, NativeTexture { native, descriptor });
            }
            Err(e) => self.device_fault("texture creation", e),
        }
    }

    pub fn stats(&self) -> DriverStats {
        let counters = self.bindings.counters();
        DriverStats {
            native_set_binds: counters.native_binds,
            native_set_allocations: counters.allocations,
            set_cache_hits: counters.hits,
            cached_render_passes: self.attachments.cached_passes() as u32,
            cached_framebuffers: self.attachments.cached_framebuffers() as u32,
            cached_sets: self.bindings.cached_sets() as u32,
            ..self.stats
        }
    }
}

fn mip_extent(extent: u32, level: u8) -> u32 {
    (extent >> level).max(1)
}

impl<B: Backend> DriverApi for CoreDriver<B> {
    fn create_texture(&mut self, handle: TextureHandle, descriptor: TextureDescriptor) {
        self.create_native_texture(handle.raw(), descriptor);
    }

    fn update_texture(&mut self, texture: TextureHandle, level: u8, pixels: PixelBufferDescriptor) {
        self.require_no_pass("update_texture");
        let descriptor = self.natives.texture_entry(texture.raw()).descriptor.clone();
        if level >= descriptor.levels {
            error!(
                "texture {} has {} levels, upload targets level {}",
                texture.raw(),
                descriptor.levels,
                level
            );
            panic!("texture upload to level {level} of a {}-level texture", descriptor.levels);
        }
        let (width, height) = (mip_extent(descriptor.width, level), mip_extent(descriptor.height, level));
        if let Err(e) = pixels.validate(width, height) {
            error!("invalid pixel buffer for texture {}: {}", texture.raw(), e);
            panic!("invalid pixel buffer for texture {}: {e}", texture.raw());
        }

        self.transition(texture.raw(), ImageLayout::TransferDst);
        let entry = self.natives.texture_entry(texture.raw());
        let result = self
            .backend
            .upload_texture(&entry.native, &entry.descriptor, level, &pixels);
        if let Err(e) = result {
            self.device_fault("texture upload", e);
            return;
        }
        if descriptor.is_sampleable() {
            self.transition(texture.raw(), ImageLayout::sampled_for(descriptor.format));
        }
    }

    fn create_buffer(&mut self, handle: BufferHandle, descriptor: BufferDescriptor) {
        match self.backend.create_buffer(&descriptor) {
            Ok(native) => {
                debug!("buffer {} created: {} bytes", handle.raw(), descriptor.size);
                self.natives.buffers.insert(
                    handle.raw(),
                    NativeBuffer {
                        native,
                        size: descriptor.size,
                    },
                );
            }
            Err(e) => self.device_fault("buffer creation", e),
        }
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: Vec<u8>) {
        let Some(entry) = self.natives.buffers.get(&buffer.raw()) else {
            missing("buffer", buffer.raw());
        };
        let end = offset.saturating_add(data.len() as u64);
        if end > entry.size {
            error!("buffer {} upload of {}..{} exceeds its {} bytes", buffer.raw(), offset, end, entry.size);
            panic!("buffer upload out of range: {}..{} of {} bytes", offset, end, entry.size);
        }
        if let Err(e) = self.backend.upload_buffer(&entry.native, offset, &data) {
            self.device_fault("buffer upload", e);
        }
    }

    fn create_set_layout(&mut self, handle: SetLayoutHandle, descriptor: SetLayoutDescriptor) {
        let mask = LayoutMask::from_descriptor(&descriptor);
        if mask.storage != 0 && !self.capabilities.storage_buffers {
            error!(
                "set layout {} declares storage buffers, unsupported by {}",
                handle.raw(),
                self.backend.name()
            );
            panic!("unsupported binding type: {} has no storage buffer support", self.backend.name());
        }
        match self.backend.create_set_layout(&mask) {
            Ok(native) => {
                debug!("set layout {} created with {} bindings", handle.raw(), descriptor.bindings.len());
                self.bindings.add_layout(handle.raw(), native, mask);
            }
            Err(e) => self.device_fault("set layout creation", e),
        }
    }

    fn create_descriptor_set(&mut self, handle: DescriptorSetHandle, layout: SetLayoutHandle) {
        self.bindings.add_set(handle.raw(), layout.raw());
    }

    fn update_descriptor_set_buffer(
        &mut self,
        set: DescriptorSetHandle,
        slot: u8,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) {
        self.bindings.update(
            set.raw(),
            slot,
            SlotContent::Buffer {
                buffer: buffer.raw(),
                offset,
                size,
            },
        );
    }

    fn update_descriptor_set_texture(
        &mut self,
        set: DescriptorSetHandle,
        slot: u8,
        texture: TextureHandle,
        sampler: SamplerParams,
    ) {
        if !self.natives.samplers.contains_key(&sampler) {
            match self.backend.create_sampler(&sampler) {
                Ok(native) => {
                    trace!("sampler created: {:?}", sampler);
                    self.natives.samplers.insert(sampler, native);
                }
                Err(e) => {
                    self.device_fault("sampler creation", e);
                    return;
                }
            }
        }
        self.bindings.update(
            set.raw(),
            slot,
            SlotContent::Texture {
                texture: texture.raw(),
                sampler,
            },
        );
    }

    fn bind_descriptor_set(&mut self, index: u8, set: DescriptorSetHandle, offsets: Vec<u32>) {
        self.bindings.bind(index, set.raw(), offsets);
        self.settle_sampled(&[set.raw()]);
    }

    fn unbind_descriptor_set(&mut self, index: u8) {
        self.bindings.unbind(index);
    }

    fn create_program(&mut self, handle: ProgramHandle, descriptor: ProgramDescriptor) {
        let layouts: Vec<Option<&B::SetLayout>> = descriptor
            .set_layouts
            .iter()
            .map(|layout| {
                layout.map(|layout| match self.bindings.layout_native(layout.raw()) {
                    Some(native) => native,
                    None => missing("set layout", layout.raw()),
                })
            })
            .collect();
        match self.backend.create_program(&descriptor, &layouts) {
            Ok(native) => {
                debug!("program {} ({}) created", handle.raw(), descriptor.name);
                self.natives.programs.insert(
                    handle.raw(),
                    NativeProgram {
                        native,
                        set_mask: descriptor.set_mask(),
                        compute: descriptor.is_compute(),
                    },
                );
            }
            Err(e) => self.device_fault("program creation", e),
        }
    }

    fn create_render_target(&mut self, handle: RenderTargetHandle, descriptor: RenderTargetDescriptor) {
        let built = attachments::build(&self.arena, &self.capabilities, &descriptor);
        for sidecar in built.new_sidecars {
            let descriptor = self.arena.texture_descriptor(sidecar);
            self.create_native_texture(sidecar.raw(), descriptor);
        }
        debug!(
            "render target {} created: {}x{}, {} colors, {} samples",
            handle.raw(),
            built.set.width,
            built.set.height,
            built.set.colors.len(),
            built.set.samples
        );
        self.targets
            .insert(handle.raw(), TargetState::Offscreen(built.set));
    }

    fn create_swap_chain(&mut self, handle: SwapChainHandle, descriptor: SwapChainDescriptor) {
        match self.backend.create_swap_chain(&descriptor) {
            Ok(native) => {
                debug!(
                    "swap chain {} created: {}x{} {:?}, {} images",
                    handle.raw(),
                    descriptor.width,
                    descriptor.height,
                    descriptor.format,
                    descriptor.image_count
                );
                self.swap_chains.insert(
                    handle.raw(),
                    SwapChainState {
                        native,
                        image: TextureDescriptor::new_2d(
                            descriptor.format,
                            descriptor.width,
                            descriptor.height,
                            TextureUsage::COLOR_ATTACHMENT,
                        ),
                        layouts: vec![ImageLayout::Undefined; descriptor.image_count.max(1) as usize],
                        acquired: None,
                        skipping: false,
                    },
                );
            }
            Err(e) => self.device_fault("swap chain creation", e),
        }
    }

    fn create_swap_chain_render_target(&mut self, handle: RenderTargetHandle, swap_chain: SwapChainHandle) {
        self.targets
            .insert(handle.raw(), TargetState::SwapChain(swap_chain.raw()));
    }

    fn begin_frame(&mut self, swap_chain: SwapChainHandle) {
        let Some(state) = self.swap_chains.get_mut(&swap_chain.raw()) else {
            missing("swap chain", swap_chain.raw());
        };
        if state.acquired.is_some() {
            error!("begin_frame on swap chain {} with a frame in progress", swap_chain.raw());
            panic!("begin_frame called twice without end_frame");
        }
        match self.backend.acquire_image(&mut state.native) {
            Ok(index) => {
                trace!("swap chain {} acquired image {}", swap_chain.raw(), index);
                state.acquired = Some(index);
                state.skipping = false;
            }
            Err(e) => match self.policy.acquire_failure {
                AcquireFailurePolicy::Panic => {
                    error!("could not acquire a swap chain image: {}", e);
                    panic!("swap chain image acquisition failed: {e}");
                }
                AcquireFailurePolicy::SkipFrame => {
                    warn!("could not acquire a swap chain image ({}), skipping frame", e);
                    state.skipping = true;
                    self.stats.frames_skipped += 1;
                }
            },
        }
    }

    fn end_frame(&mut self, swap_chain: SwapChainHandle) {
        let raw = swap_chain.raw();
        let Some(state) = self.swap_chains.get_mut(&raw) else {
            missing("swap chain", raw);
        };
        if state.skipping {
            state.skipping = false;
            return;
        }
        let Some(index) = state.acquired.take() else {
            error!("end_frame on swap chain {} without begin_frame", raw);
            panic!("end_frame called without begin_frame");
        };
        self.transition_swap_chain_image(raw, index, ImageLayout::Present);
        let Some(state) = self.swap_chains.get_mut(&raw) else {
            missing("swap chain", raw);
        };
        match self.backend.present(&mut state.native, index) {
            Ok(()) => self.stats.frames_presented += 1,
            Err(e) => self.device_fault("present", e),
        }
    }

    fn begin_render_pass(&mut self, target: RenderTargetHandle, params: RenderPassParams) {
        if let Some(active) = &self.pass {
            error!("render pass on {} begun while {} is active", target.raw(), active.target);
            panic!("begin_render_pass inside an active render pass");
        }
        let state = self.target_state(target.raw());
        self.settle_declared(&state);
        let pass = match state {
            TargetState::Offscreen(set) => self.begin_offscreen_pass(target.raw(), &set, &params),
            TargetState::SwapChain(swap_chain) => {
                self.begin_swap_chain_pass(target.raw(), swap_chain, &params)
            }
        };
        let Some(pass) = pass else {
            return;
        };
        if !pass.is_skipped() {
            let viewport = if params.viewport.width == 0 || params.viewport.height == 0 {
                Rect2D::new(0, 0, pass.width, pass.height)
            } else {
                params.viewport
            };
            self.backend.set_viewport(flip_viewport(viewport, pass.height));
            self.backend
                .set_scissor(Rect2D::new(0, 0, pass.width, pass.height));
            self.stats.render_passes += 1;
        }
        self.pass = Some(pass);
    }

    fn end_render_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            error!("end_render_pass without an active render pass");
            panic!("end_render_pass requires an active render pass");
        };
        self.pipeline = None;
        match pass.framebuffer {
            PassFramebuffer::Skipped => {}
            PassFramebuffer::Cached(_) => {
                self.backend.end_render_pass();
                if let TargetState::Offscreen(set) = self.target_state(pass.target) {
                    let bases = set.colors.iter().chain(set.depth.iter()).map(|a| a.base.texture);
                    for texture in bases {
                        let declared = self.arena.with_texture(texture, |descriptor, state| {
                            if descriptor.is_sampleable() {
                                state.declared = Some(ImageLayout::sampled_for(descriptor.format));
                            }
                            state.declared.is_some()
                        });
                        if declared && !self.declared.contains(&texture.raw()) {
                            self.declared.push(texture.raw());
                        }
                    }
                }
            }
            PassFramebuffer::Transient {
                framebuffer,
                swap_chain,
                image,
            } => {
                self.backend.end_render_pass();
                self.attachments.bury_framebuffer(framebuffer, self.seq);
                self.transition_swap_chain_image(swap_chain, image, ImageLayout::Present);
            }
        }
    }

    fn set_viewport(&mut self, viewport: Rect2D) {
        let pass = expect_pass(&self.pass, "set_viewport");
        if pass.is_skipped() {
            return;
        }
        let flipped = flip_viewport(viewport, pass.height);
        self.backend.set_viewport(flipped);
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        let pass = expect_pass(&self.pass, "set_scissor");
        if pass.is_skipped() {
            return;
        }
        let clamped = clamp_scissor(scissor, pass.width, pass.height);
        self.backend.set_scissor(clamped);
    }

    fn bind_pipeline(&mut self, state: PipelineState) {
        let pass = expect_pass(&self.pass, "bind_pipeline");
        if pass.is_skipped() {
            return;
        }
        let program = self.natives.program(state.program.raw());
        if program.compute {
            error!("compute program {} bound as a graphics pipeline", state.program.raw());
            panic!("program {} is a compute program", state.program.raw());
        }
        let Some(native_pass) = self.attachments.pass(&pass.key) else {
            return;
        };
        let result = self
            .backend
            .bind_pipeline(&program.native, &state.raster, native_pass, &pass.key);
        match result {
            Ok(()) => self.pipeline = Some(state.program.raw()),
            Err(e) => self.device_fault("pipeline creation", e),
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        if expect_pass(&self.pass, "draw").is_skipped() {
            return;
        }
        let Some(program) = self.pipeline else {
            error!("draw without a bound pipeline");
            panic!("draw requires a bound pipeline");
        };
        if self.commit(program) {
            self.backend.draw(vertex_count, instance_count, first_vertex);
        }
    }

    fn dispatch_compute(&mut self, program: ProgramHandle, groups: [u32; 3]) {
        self.require_no_pass("dispatch_compute");
        if !self.natives.program(program.raw()).compute {
            error!("graphics program {} dispatched as compute", program.raw());
            panic!("program {} is not a compute program", program.raw());
        }
        if !self.commit(program.raw()) {
            return;
        }
        let native = &self.natives.program(program.raw()).native;
        if let Err(e) = self.backend.dispatch(native, groups) {
            self.device_fault("compute dispatch", e);
        }
    }

    fn clear_binding_history(&mut self) {
        self.require_no_pass("clear_binding_history");
        self.submit_recorded();
        if let Err(e) = self.backend.wait_idle() {
            self.device_fault("wait for device idle", e);
            return;
        }
        self.bindings.clear_history();
    }

    fn clear_attachment_cache(&mut self) {
        self.require_no_pass("clear_attachment_cache");
        self.attachments.clear();
    }

    fn insert_event_marker(&mut self, label: String) {
        self.backend.insert_marker(&label);
    }

    fn get_capabilities(&mut self) -> Capabilities {
        self.capabilities.clone()
    }

    fn is_texture_format_supported(&mut self, format: TextureFormat, usage: TextureUsage) -> bool {
        self.backend.is_format_supported(format, usage)
    }

    fn get_stats(&mut self) -> DriverStats {
        self.stats()
    }
}
