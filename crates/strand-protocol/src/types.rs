use bitflags::bitflags;

use crate::handle::{ProgramHandle, SetLayoutHandle, TextureHandle};

/// Maximum number of color attachments in one render target.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Maximum number of descriptor sets a program can use.
pub const MAX_DESCRIPTOR_SETS: usize = 4;

// ============================================================================
// Textures
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u16 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_ATTACHMENT = 1 << 1;
        const STENCIL_ATTACHMENT = 1 << 2;
        const UPLOADABLE = 1 << 3;
        const SAMPLEABLE = 1 << 4;
        const SUBPASS_INPUT = 1 << 5;
        const BLIT_SRC = 1 << 6;
        const BLIT_DST = 1 << 7;
        const ALL_ATTACHMENTS = Self::COLOR_ATTACHMENT.bits()
            | Self::DEPTH_ATTACHMENT.bits()
            | Self::STENCIL_ATTACHMENT.bits()
            | Self::SUBPASS_INPUT.bits();
    }
}

bitflags! {
    /// Supported multisample counts, one bit per power of two.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SampleCounts: u8 {
        const S1 = 1;
        const S2 = 2;
        const S4 = 4;
        const S8 = 8;
        const S16 = 16;
        const S32 = 32;
        const S64 = 64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rg8,
    Rgba8,
    Srgb8A8,
    Bgra8,
    R32F,
    Rgba16F,
    Rgba32F,
    Depth16,
    Depth24,
    Depth32F,
    Depth24Stencil8,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16 | Self::Depth24 | Self::Depth32F | Self::Depth24Stencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        self == Self::Depth24Stencil8
    }

    /// Bytes per texel of the uncompressed format.
    pub fn texel_size(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rg8 | Self::Depth16 => 2,
            Self::Rgba8
            | Self::Srgb8A8
            | Self::Bgra8
            | Self::R32F
            | Self::Depth24
            | Self::Depth32F
            | Self::Depth24Stencil8 => 4,
            Self::Rgba16F => 8,
            Self::Rgba32F => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SamplerTarget {
    #[default]
    Texture2d,
    Texture2dArray,
    Cubemap,
    Texture3d,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub target: SamplerTarget,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u8,
    pub samples: u8,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    /// A single-level, single-sample 2D texture.
    pub fn new_2d(format: TextureFormat, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            target: SamplerTarget::Texture2d,
            format,
            width,
            height,
            depth: 1,
            levels: 1,
            samples: 1,
            usage,
        }
    }

    /// Attachment twin with the given sample count. Non-attachment usage is dropped
    /// so backends can use transient memory for it.
    pub fn multisample_twin(&self, samples: u8) -> Self {
        Self {
            levels: 1,
            samples,
            usage: self.usage & TextureUsage::ALL_ATTACHMENTS,
            ..self.clone()
        }
    }

    pub fn is_sampleable(&self) -> bool {
        self.usage.contains(TextureUsage::SAMPLEABLE)
    }
}

// ============================================================================
// Buffers
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u8 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
}

// ============================================================================
// Samplers
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SamplerParams {
    pub mag: Filter,
    pub min: Filter,
    pub mip: Filter,
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub wrap_r: WrapMode,
    /// Depth comparison sampling (shadow maps).
    pub compare: bool,
}

// ============================================================================
// Programs and pipeline state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    Graphics { vertex: Vec<u32>, fragment: Vec<u32> },
    Compute { compute: Vec<u32> },
}

/// Shader binaries are supplied by the caller as SPIR-V words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub name: String,
    pub source: ShaderSource,
    /// Descriptor set layouts indexed by set number.
    pub set_layouts: Vec<Option<SetLayoutHandle>>,
}

impl ProgramDescriptor {
    pub fn is_compute(&self) -> bool {
        matches!(self.source, ShaderSource::Compute { .. })
    }

    /// Bitmask of the set indices the program declares.
    pub fn set_mask(&self) -> u8 {
        self.set_layouts
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_some())
            .fold(0u8, |mask, (i, _)| mask | (1 << i))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CullingMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub culling: CullingMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: bool,
    pub color_write: bool,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            culling: CullingMode::default(),
            depth_test: false,
            depth_write: false,
            blend: false,
            color_write: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub program: ProgramHandle,
    pub raster: RasterState,
}

// ============================================================================
// Render targets and passes
// ============================================================================

/// A single texture level/layer used as a render-pass attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub texture: TextureHandle,
    pub level: u8,
    pub layer: u16,
}

impl Attachment {
    pub fn new(texture: TextureHandle) -> Self {
        Self {
            texture,
            level: 0,
            layer: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTargetDescriptor {
    pub width: u32,
    pub height: u32,
    pub color: Vec<Attachment>,
    pub depth: Option<Attachment>,
    pub samples: u8,
    pub layer_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapChainDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub image_count: u8,
}

bitflags! {
    /// Attachments affected by clear/discard flags of a render pass.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TargetBufferFlags: u16 {
        const COLOR0 = 1 << 0;
        const COLOR1 = 1 << 1;
        const COLOR2 = 1 << 2;
        const COLOR3 = 1 << 3;
        const COLOR4 = 1 << 4;
        const COLOR5 = 1 << 5;
        const COLOR6 = 1 << 6;
        const COLOR7 = 1 << 7;
        const DEPTH = 1 << 8;
        const STENCIL = 1 << 9;
        const COLOR_ALL = 0xff;
        const ALL = 0x3ff;
    }
}

/// Integer rectangle in the engine's top-left-origin coordinate system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassParams {
    pub clear: TargetBufferFlags,
    pub discard_start: TargetBufferFlags,
    pub discard_end: TargetBufferFlags,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub viewport: Rect2D,
}

impl Default for RenderPassParams {
    fn default() -> Self {
        Self {
            clear: TargetBufferFlags::empty(),
            discard_start: TargetBufferFlags::empty(),
            discard_end: TargetBufferFlags::empty(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            viewport: Rect2D::default(),
        }
    }
}

// ============================================================================
// Query results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub backend: String,
    pub device_name: String,
    pub color_sample_counts: SampleCounts,
    pub depth_sample_counts: SampleCounts,
    pub storage_buffers: bool,
    pub max_color_attachments: u8,
    pub uniform_offset_alignment: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub buffers_executed: u64,
    pub commands_executed: u64,
    pub native_set_binds: u64,
    pub native_set_allocations: u64,
    pub set_cache_hits: u64,
    pub layout_transitions: u64,
    pub render_passes: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub resources_destroyed: u64,
    pub cached_render_passes: u32,
    pub cached_framebuffers: u32,
    pub cached_sets: u32,
}
