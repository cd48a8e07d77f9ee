//! A backend without a GPU.
//!
//! Native objects are plain ids. Every call is appended to a log shared with
//! a [`HeadlessProbe`], which tests use as a synthetic GPU: they read the log,
//! control when submitted buffers retire, inject acquisition and allocation
//! failures and choose the advertised sample counts.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use strand_core::ImageLayout;
use strand_protocol::{
    BufferDescriptor, Capabilities, LayoutMask, PixelBufferDescriptor, ProgramDescriptor,
    RasterState, Rect2D, RenderPassParams, SampleCounts, SamplerParams, SwapChainDescriptor,
    TextureDescriptor, TextureFormat, TextureUsage,
};
use tracing::trace;

use crate::backend::{Backend, FramebufferAttachment, RenderPassKey, SetWrite};
use crate::error::{AcquireError, BackendError};

/// Identity of a headless native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(pub u64);

pub struct HeadlessSetLayout {
    pub id: NativeId,
    pub mask: LayoutMask,
}

pub struct HeadlessSwapChain {
    pub id: NativeId,
    images: Vec<NativeId>,
    next: u32,
}

/// One call the driver made into the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    CreateTexture {
        id: NativeId,
        width: u32,
        height: u32,
        samples: u8,
    },
    DestroyTexture(NativeId),
    UploadTexture {
        id: NativeId,
        level: u8,
        bytes: usize,
    },
    CreateBuffer {
        id: NativeId,
        size: u64,
    },
    DestroyBuffer(NativeId),
    UploadBuffer {
        id: NativeId,
        offset: u64,
        bytes: usize,
    },
    CreateSampler(NativeId),
    DestroySampler(NativeId),
    CreateProgram {
        id: NativeId,
        name: String,
    },
    DestroyProgram(NativeId),
    CreateSetLayout(NativeId),
    DestroySetLayout(NativeId),
    AllocateSet {
        id: NativeId,
        layout: NativeId,
    },
    WriteSet {
        set: NativeId,
        slots: Vec<u8>,
    },
    BindSet {
        index: u8,
        set: NativeId,
        offsets: Vec<u32>,
    },
    Transition {
        texture: NativeId,
        from: ImageLayout,
        to: ImageLayout,
    },
    CreateRenderPass {
        id: NativeId,
        samples: u8,
    },
    DestroyRenderPass(NativeId),
    CreateFramebuffer {
        id: NativeId,
        attachments: Vec<NativeId>,
    },
    DestroyFramebuffer(NativeId),
    BeginRenderPass {
        pass: NativeId,
        framebuffer: NativeId,
    },
    EndRenderPass,
    SetViewport(Rect2D),
    SetScissor(Rect2D),
    BindPipeline {
        program: NativeId,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
    },
    Dispatch {
        program: NativeId,
        groups: [u32; 3],
    },
    Marker(String),
    CreateSwapChain(NativeId),
    DestroySwapChain(NativeId),
    Acquire {
        swap_chain: NativeId,
        image: u32,
    },
    Present {
        swap_chain: NativeId,
        image: u32,
    },
    Submit(u64),
    WaitIdle,
}

struct ProbeState {
    calls: Vec<NativeCall>,
    manual_retirement: bool,
    /// Frontier granted by the test when retirement is manual.
    granted: u64,
    submitted: u64,
    acquire_failures: VecDeque<AcquireError>,
    allocation_failures: VecDeque<BackendError>,
    capabilities: Capabilities,
}

/// Test-side view of a headless backend.
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl HeadlessProbe {
    pub fn calls(&self) -> Vec<NativeCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Event markers in the order the backend saw them.
    pub fn markers(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                NativeCall::Marker(label) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    /// With manual retirement, submitted buffers only retire through
    /// [`HeadlessProbe::retire_up_to`] or a wait for idle.
    pub fn set_manual_retirement(&self, manual: bool) {
        self.state.lock().manual_retirement = manual;
    }

    pub fn retire_up_to(&self, seq: u64) {
        let mut state = self.state.lock();
        state.granted = state.granted.max(seq);
    }

    /// Highest buffer sequence submitted so far.
    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    pub fn fail_next_acquire(&self, error: AcquireError) {
        self.state.lock().acquire_failures.push_back(error);
    }

    /// The next native object creation fails with `error`.
    pub fn fail_next_allocation(&self, error: BackendError) {
        self.state.lock().allocation_failures.push_back(error);
    }

    /// Must be called before the engine starts.
    pub fn set_sample_counts(&self, color: SampleCounts, depth: SampleCounts) {
        let mut state = self.state.lock();
        state.capabilities.color_sample_counts = color;
        state.capabilities.depth_sample_counts = depth;
    }

    /// Must be called before the engine starts.
    pub fn set_storage_buffers(&self, supported: bool) {
        self.state.lock().capabilities.storage_buffers = supported;
    }
}

pub struct HeadlessBackend {
    state: Arc<Mutex<ProbeState>>,
    next_id: u64,
}

pub fn default_capabilities() -> Capabilities {
    Capabilities {
        backend: "headless".to_string(),
        device_name: "headless device".to_string(),
        color_sample_counts: SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4 | SampleCounts::S8,
        depth_sample_counts: SampleCounts::S1 | SampleCounts::S2 | SampleCounts::S4 | SampleCounts::S8,
        storage_buffers: true,
        max_color_attachments: 8,
        uniform_offset_alignment: 256,
    }
}

impl HeadlessBackend {
    pub fn new() -> (Self, HeadlessProbe) {
        let state = Arc::new(Mutex::new(ProbeState {
            calls: Vec::new(),
            manual_retirement: false,
            granted: 0,
            submitted: 0,
            acquire_failures: VecDeque::new(),
            allocation_failures: VecDeque::new(),
            capabilities: default_capabilities(),
        }));
        let probe = HeadlessProbe {
            state: state.clone(),
        };
        (Self { state, next_id: 1 }, probe)
    }

    fn record(&self, call: NativeCall) {
        trace!("headless: {:?}", call);
        self.state.lock().calls.push(call);
    }

    fn allocate(&mut self) -> Result<NativeId, BackendError> {
        if let Some(error) = self.state.lock().allocation_failures.pop_front() {
            return Err(error);
        }
        let id = NativeId(self.next_id);
        self.next_id += 1;
        Ok(id)
    }
}

impl Backend for HeadlessBackend {
    type Texture = NativeId;
    type Buffer = NativeId;
    type Sampler = NativeId;
    type SetLayout = HeadlessSetLayout;
    type DescriptorSet = NativeId;
    type Program = NativeId;
    type RenderPass = NativeId;
    type Framebuffer = NativeId;
    type SwapChain = HeadlessSwapChain;

    fn name(&self) -> &'static str {
        "headless"
    }

    fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities.clone()
    }

    fn is_format_supported(&self, format: TextureFormat, usage: TextureUsage) -> bool {
        // Depth formats cannot be color attachments and vice versa.
        if format.is_depth() {
            !usage.contains(TextureUsage::COLOR_ATTACHMENT)
        } else {
            !usage.intersects(TextureUsage::DEPTH_ATTACHMENT | TextureUsage::STENCIL_ATTACHMENT)
        }
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateTexture {
            id,
            width: descriptor.width,
            height: descriptor.height,
            samples: descriptor.samples,
        });
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: NativeId) {
        self.record(NativeCall::DestroyTexture(texture));
    }

    fn upload_texture(
        &mut self,
        texture: &NativeId,
        _descriptor: &TextureDescriptor,
        level: u8,
        pixels: &PixelBufferDescriptor,
    ) -> Result<(), BackendError> {
        self.record(NativeCall::UploadTexture {
            id: *texture,
            level,
            bytes: pixels.data.len(),
        });
        Ok(())
    }

    fn create_buffer(&mut self, descriptor: &BufferDescriptor) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateBuffer {
            id,
            size: descriptor.size,
        });
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: NativeId) {
        self.record(NativeCall::DestroyBuffer(buffer));
    }

    fn upload_buffer(&mut self, buffer: &NativeId, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        self.record(NativeCall::UploadBuffer {
            id: *buffer,
            offset,
            bytes: data.len(),
        });
        Ok(())
    }

    fn create_sampler(&mut self, _params: &SamplerParams) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateSampler(id));
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: NativeId) {
        self.record(NativeCall::DestroySampler(sampler));
    }

    fn create_program(
        &mut self,
        descriptor: &ProgramDescriptor,
        _set_layouts: &[Option<&HeadlessSetLayout>],
    ) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateProgram {
            id,
            name: descriptor.name.clone(),
        });
        Ok(id)
    }

    fn destroy_program(&mut self, program: NativeId) {
        self.record(NativeCall::DestroyProgram(program));
    }

    fn create_set_layout(&mut self, mask: &LayoutMask) -> Result<HeadlessSetLayout, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateSetLayout(id));
        Ok(HeadlessSetLayout { id, mask: *mask })
    }

    fn destroy_set_layout(&mut self, layout: HeadlessSetLayout) {
        self.record(NativeCall::DestroySetLayout(layout.id));
    }

    fn allocate_set(&mut self, layout: &mut HeadlessSetLayout) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::AllocateSet {
            id,
            layout: layout.id,
        });
        Ok(id)
    }

    fn write_set(&mut self, set: &NativeId, writes: &[SetWrite<'_, Self>]) {
        self.record(NativeCall::WriteSet {
            set: *set,
            slots: writes.iter().map(|w| w.slot).collect(),
        });
    }

    fn bind_set(&mut self, _program: &NativeId, index: u8, set: &NativeId, dynamic_offsets: &[u32]) {
        self.record(NativeCall::BindSet {
            index,
            set: *set,
            offsets: dynamic_offsets.to_vec(),
        });
    }

    fn transition(
        &mut self,
        texture: &NativeId,
        _descriptor: &TextureDescriptor,
        from: ImageLayout,
        to: ImageLayout,
    ) {
        self.record(NativeCall::Transition {
            texture: *texture,
            from,
            to,
        });
    }

    fn create_render_pass(&mut self, key: &RenderPassKey) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateRenderPass {
            id,
            samples: key.samples,
        });
        Ok(id)
    }

    fn destroy_render_pass(&mut self, pass: NativeId) {
        self.record(NativeCall::DestroyRenderPass(pass));
    }

    fn create_framebuffer(
        &mut self,
        _pass: &NativeId,
        attachments: &[FramebufferAttachment<'_, Self>],
        _width: u32,
        _height: u32,
        _layers: u32,
    ) -> Result<NativeId, BackendError> {
        let id = self.allocate()?;
        self.record(NativeCall::CreateFramebuffer {
            id,
            attachments: attachments.iter().map(|a| *a.texture).collect(),
        });
        Ok(id)
    }

    fn destroy_framebuffer(&mut self, framebuffer: NativeId) {
        self.record(NativeCall::DestroyFramebuffer(framebuffer));
    }

    fn begin_render_pass(
        &mut self,
        pass: &NativeId,
        framebuffer: &NativeId,
        _key: &RenderPassKey,
        _params: &RenderPassParams,
        _width: u32,
        _height: u32,
    ) {
        self.record(NativeCall::BeginRenderPass {
            pass: *pass,
            framebuffer: *framebuffer,
        });
    }

    fn end_render_pass(&mut self) {
        self.record(NativeCall::EndRenderPass);
    }

    fn set_viewport(&mut self, viewport: Rect2D) {
        self.record(NativeCall::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: Rect2D) {
        self.record(NativeCall::SetScissor(scissor));
    }

    fn bind_pipeline(
        &mut self,
        program: &NativeId,
        _raster: &RasterState,
        _pass: &NativeId,
        _key: &RenderPassKey,
    ) -> Result<(), BackendError> {
        self.record(NativeCall::BindPipeline { program: *program });
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        self.record(NativeCall::Draw {
            vertex_count,
            instance_count,
            first_vertex,
        });
    }

    fn dispatch(&mut self, program: &NativeId, groups: [u32; 3]) -> Result<(), BackendError> {
        self.record(NativeCall::Dispatch {
            program: *program,
            groups,
        });
        Ok(())
    }

    fn insert_marker(&mut self, label: &str) {
        self.record(NativeCall::Marker(label.to_string()));
    }

    fn create_swap_chain(
        &mut self,
        descriptor: &SwapChainDescriptor,
    ) -> Result<HeadlessSwapChain, BackendError> {
        let id = self.allocate()?;
        let mut images = Vec::new();
        for _ in 0..descriptor.image_count.max(1) {
            images.push(self.allocate()?);
        }
        self.record(NativeCall::CreateSwapChain(id));
        Ok(HeadlessSwapChain {
            id,
            images,
            next: 0,
        })
    }

    fn destroy_swap_chain(&mut self, swap_chain: HeadlessSwapChain) {
        self.record(NativeCall::DestroySwapChain(swap_chain.id));
    }

    fn acquire_image(&mut self, swap_chain: &mut HeadlessSwapChain) -> Result<u32, AcquireError> {
        if let Some(error) = self.state.lock().acquire_failures.pop_front() {
            return Err(error);
        }
        let image = swap_chain.next;
        swap_chain.next = (swap_chain.next + 1) % swap_chain.images.len() as u32;
        self.record(NativeCall::Acquire {
            swap_chain: swap_chain.id,
            image,
        });
        Ok(image)
    }

    fn swap_chain_image<'a>(&self, swap_chain: &'a HeadlessSwapChain, index: u32) -> &'a NativeId {
        &swap_chain.images[index as usize]
    }

    fn present(&mut self, swap_chain: &mut HeadlessSwapChain, index: u32) -> Result<(), BackendError> {
        self.record(NativeCall::Present {
            swap_chain: swap_chain.id,
            image: index,
        });
        Ok(())
    }

    fn submit(&mut self, seq: u64) -> Result<(), BackendError> {
        self.record(NativeCall::Submit(seq));
        let mut state = self.state.lock();
        state.submitted = state.submitted.max(seq);
        Ok(())
    }

    fn retired(&mut self) -> Result<u64, BackendError> {
        let state = self.state.lock();
        if state.manual_retirement {
            Ok(state.granted.min(state.submitted))
        } else {
            Ok(state.submitted)
        }
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        self.record(NativeCall::WaitIdle);
        let mut state = self.state.lock();
        state.granted = state.granted.max(state.submitted);
        Ok(())
    }
}
