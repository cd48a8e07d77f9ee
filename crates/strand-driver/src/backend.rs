//! The downstream contract a concrete GPU backend implements.
//!
//! Everything here runs on the execution thread. Backends own native objects
//! through their associated types; the generic driver decides when to create,
//! bind, transition and destroy them.

use strand_core::ImageLayout;
use strand_protocol::{
    BindingKind, BufferDescriptor, Capabilities, LayoutMask, PixelBufferDescriptor,
    ProgramDescriptor, RasterState, Rect2D, RenderPassParams, SamplerParams,
    SwapChainDescriptor, TargetBufferFlags, TextureDescriptor, TextureFormat, TextureUsage,
};

use crate::error::{AcquireError, BackendError};

/// Everything that shapes a native render pass. Recomputed from the current
/// attachments at every `begin_render_pass`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub colors: Vec<TextureFormat>,
    pub depth: Option<TextureFormat>,
    pub samples: u8,
    /// Color attachments rendered into a multisample sidecar and resolved
    /// into the base texture, one bit per color index.
    pub resolve: u8,
    pub clear: TargetBufferFlags,
    pub discard_start: TargetBufferFlags,
    pub discard_end: TargetBufferFlags,
    pub layer_count: u8,
}

impl RenderPassKey {
    pub fn has_resolve(&self, color: usize) -> bool {
        self.resolve & (1 << color) != 0
    }
}

/// One image bound to a framebuffer. Order: colors, resolves, depth.
pub struct FramebufferAttachment<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub descriptor: &'a TextureDescriptor,
    pub level: u8,
    pub layer: u16,
}

pub enum WriteResource<'a, B: Backend> {
    Buffer {
        buffer: &'a B::Buffer,
        offset: u64,
        size: u64,
    },
    Texture {
        texture: &'a B::Texture,
        sampler: &'a B::Sampler,
        layout: ImageLayout,
    },
}

/// One slot written into a native descriptor set.
pub struct SetWrite<'a, B: Backend> {
    pub slot: u8,
    pub kind: BindingKind,
    pub resource: WriteResource<'a, B>,
}

pub trait Backend: Sized + 'static {
    type Texture;
    type Buffer;
    type Sampler;
    type SetLayout;
    type DescriptorSet;
    type Program;
    type RenderPass;
    type Framebuffer;
    type SwapChain;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn is_format_supported(&self, format: TextureFormat, usage: TextureUsage) -> bool;

    // ── Resources ───────────────────────────────────────────

    fn create_texture(&mut self, descriptor: &TextureDescriptor)
        -> Result<Self::Texture, BackendError>;

    fn destroy_texture(&mut self, texture: Self::Texture);

    /// Copies pixels into `level`. The image is in `ImageLayout::TransferDst`.
    fn upload_texture(
        &mut self,
        texture: &Self::Texture,
        descriptor: &TextureDescriptor,
        level: u8,
        pixels: &PixelBufferDescriptor,
    ) -> Result<(), BackendError>;

    fn create_buffer(&mut self, descriptor: &BufferDescriptor)
        -> Result<Self::Buffer, BackendError>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    fn upload_buffer(
        &mut self,
        buffer: &Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn create_sampler(&mut self, params: &SamplerParams) -> Result<Self::Sampler, BackendError>;

    fn destroy_sampler(&mut self, sampler: Self::Sampler);

    /// `set_layouts` is indexed by descriptor set number.
    fn create_program(
        &mut self,
        descriptor: &ProgramDescriptor,
        set_layouts: &[Option<&Self::SetLayout>],
    ) -> Result<Self::Program, BackendError>;

    fn destroy_program(&mut self, program: Self::Program);

    // ── Bindings ────────────────────────────────────────────

    fn create_set_layout(&mut self, mask: &LayoutMask) -> Result<Self::SetLayout, BackendError>;

    /// Destroys the layout together with every set allocated from it.
    fn destroy_set_layout(&mut self, layout: Self::SetLayout);

    fn allocate_set(
        &mut self,
        layout: &mut Self::SetLayout,
    ) -> Result<Self::DescriptorSet, BackendError>;

    fn write_set(&mut self, set: &Self::DescriptorSet, writes: &[SetWrite<'_, Self>]);

    fn bind_set(
        &mut self,
        program: &Self::Program,
        index: u8,
        set: &Self::DescriptorSet,
        dynamic_offsets: &[u32],
    );

    // ── Attachments ─────────────────────────────────────────

    fn transition(
        &mut self,
        texture: &Self::Texture,
        descriptor: &TextureDescriptor,
        from: ImageLayout,
        to: ImageLayout,
    );

    fn create_render_pass(&mut self, key: &RenderPassKey)
        -> Result<Self::RenderPass, BackendError>;

    fn destroy_render_pass(&mut self, pass: Self::RenderPass);

    fn create_framebuffer(
        &mut self,
        pass: &Self::RenderPass,
        attachments: &[FramebufferAttachment<'_, Self>],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<Self::Framebuffer, BackendError>;

    fn destroy_framebuffer(&mut self, framebuffer: Self::Framebuffer);

    fn begin_render_pass(
        &mut self,
        pass: &Self::RenderPass,
        framebuffer: &Self::Framebuffer,
        key: &RenderPassKey,
        params: &RenderPassParams,
        width: u32,
        height: u32,
    );

    fn end_render_pass(&mut self);

    /// Rectangles arrive already converted to the native origin.
    fn set_viewport(&mut self, viewport: Rect2D);

    fn set_scissor(&mut self, scissor: Rect2D);

    // ── Work ────────────────────────────────────────────────

    fn bind_pipeline(
        &mut self,
        program: &Self::Program,
        raster: &RasterState,
        pass: &Self::RenderPass,
        key: &RenderPassKey,
    ) -> Result<(), BackendError>;

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32);

    fn dispatch(&mut self, program: &Self::Program, groups: [u32; 3])
        -> Result<(), BackendError>;

    fn insert_marker(&mut self, label: &str);

    // ── Swap chains ─────────────────────────────────────────

    fn create_swap_chain(
        &mut self,
        descriptor: &SwapChainDescriptor,
    ) -> Result<Self::SwapChain, BackendError>;

    fn destroy_swap_chain(&mut self, swap_chain: Self::SwapChain);

    fn acquire_image(&mut self, swap_chain: &mut Self::SwapChain) -> Result<u32, AcquireError>;

    fn swap_chain_image<'a>(&self, swap_chain: &'a Self::SwapChain, index: u32)
        -> &'a Self::Texture;

    fn present(&mut self, swap_chain: &mut Self::SwapChain, index: u32)
        -> Result<(), BackendError>;

    // ── Submission ──────────────────────────────────────────

    /// Submits everything recorded since the previous call as buffer `seq`.
    fn submit(&mut self, seq: u64) -> Result<(), BackendError>;

    /// Highest submitted sequence whose GPU work completed.
    fn retired(&mut self) -> Result<u64, BackendError>;

    fn wait_idle(&mut self) -> Result<(), BackendError>;
}
