//! Attachment sets and the render-pass / framebuffer caches built from them.

use std::collections::HashMap;

use strand_core::{reduce_sample_count, ResourceArena};
use strand_protocol::{
    Attachment, Capabilities, RawHandle, RenderPassParams, RenderTargetDescriptor, SampleCounts,
    TextureFormat, TextureHandle, MAX_COLOR_ATTACHMENTS,
};
use tracing::{debug, error, trace};

use crate::backend::{Backend, FramebufferAttachment, RenderPassKey};
use crate::error::BackendError;

/// Rejects render targets the attachment builder cannot express. Called on
/// the client thread at creation and again before building.
pub fn validate_render_target(descriptor: &RenderTargetDescriptor) {
    if descriptor.color.is_empty() && descriptor.depth.is_none() {
        error!("render target {}x{} has no attachments", descriptor.width, descriptor.height);
        panic!("render target must have at least one attachment");
    }
    if descriptor.color.len() > MAX_COLOR_ATTACHMENTS {
        error!(
            "render target declares {} color attachments, the maximum is {}",
            descriptor.color.len(),
            MAX_COLOR_ATTACHMENTS
        );
        panic!(
            "render target has {} color attachments, exceeding the maximum of {}",
            descriptor.color.len(),
            MAX_COLOR_ATTACHMENTS
        );
    }
}

/// One attachment after sample-count resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub base: Attachment,
    pub format: TextureFormat,
    /// Multisample twin rendered into instead of `base`. Color sidecars
    /// resolve into `base` at the end of the pass.
    pub sidecar: Option<TextureHandle>,
}

impl ResolvedAttachment {
    /// The texture the pass actually renders into.
    pub fn rendered(&self) -> TextureHandle {
        self.sidecar.unwrap_or(self.base.texture)
    }
}

/// Attachments of an offscreen render target, with sidecars in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSet {
    pub width: u32,
    pub height: u32,
    pub colors: Vec<ResolvedAttachment>,
    pub depth: Option<ResolvedAttachment>,
    pub samples: u8,
    pub layer_count: u8,
}

/// Built attachment set plus the sidecars whose native objects still need
/// creating.
pub struct Built {
    pub set: AttachmentSet,
    pub new_sidecars: Vec<TextureHandle>,
}

/// Usable sample counts: the intersection of the masks of every attachment kind present.
pub fn sample_mask(capabilities: &Capabilities, has_color: bool, has_depth: bool) -> SampleCounts {
    let mut mask = SampleCounts::all();
    if has_color {
        mask &= capabilities.color_sample_counts;
    }
    if has_depth {
        mask &= capabilities.depth_sample_counts;
    }
    mask
}

/// Validates a render target, clamps its sample count and registers a
/// multisample sidecar for every single-sampled attachment when multisampling.
pub fn build(
    arena: &ResourceArena,
    capabilities: &Capabilities,
    descriptor: &RenderTargetDescriptor,
) -> Built {
    validate_render_target(descriptor);

    let mask = sample_mask(
        capabilities,
        !descriptor.color.is_empty(),
        descriptor.depth.is_some(),
    );
    let samples = reduce_sample_count(descriptor.samples, mask);
    if samples != descriptor.samples.max(1) {
        debug!(
            "render target sample count {} reduced to {}",
            descriptor.samples, samples
        );
    }

    let mut new_sidecars = Vec::new();
    let mut resolve = |attachment: &Attachment| {
        let texture = arena.texture_descriptor(attachment.texture);
        let sidecar = if samples > 1 && texture.samples <= 1 {
            let (sidecar, created) = arena.sidecar(attachment.texture, samples);
            if created {
                new_sidecars.push(sidecar);
            }
            Some(sidecar)
        } else {
            None
        };
        ResolvedAttachment {
            base: *attachment,
            format: texture.format,
            sidecar,
        }
    };

    let colors = descriptor.color.iter().map(&mut resolve).collect();
    let depth = descriptor.depth.as_ref().map(&mut resolve);

    Built {
        set: AttachmentSet {
            width: descriptor.width,
            height: descriptor.height,
            colors,
            depth,
            samples,
            layer_count: descriptor.layer_count.max(1),
        },
        new_sidecars,
    }
}

impl AttachmentSet {
    /// Derives the render-pass key for this set and the pass parameters.
    pub fn key(&self, params: &RenderPassParams) -> RenderPassKey {
        let resolve = self
            .colors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.sidecar.is_some())
            .fold(0u8, |bits, (i, _)| bits | (1 << i));
        RenderPassKey {
            colors: self.colors.iter().map(|c| c.format).collect(),
            depth: self.depth.map(|d| d.format),
            samples: self.samples,
            resolve,
            clear: params.clear,
            discard_start: params.discard_start,
            discard_end: params.discard_end,
            layer_count: self.layer_count,
        }
    }

    /// Framebuffer images in binding order: colors, resolves, depth.
    pub fn images(&self) -> Vec<FramebufferImage> {
        let rendered = |a: &ResolvedAttachment| FramebufferImage::Texture {
            texture: a.rendered().raw(),
            level: if a.sidecar.is_some() { 0 } else { a.base.level },
            layer: if a.sidecar.is_some() { 0 } else { a.base.layer },
        };
        let mut images: Vec<FramebufferImage> = self.colors.iter().map(rendered).collect();
        images.extend(
            self.colors
                .iter()
                .filter(|c| c.sidecar.is_some())
                .map(|c| FramebufferImage::Texture {
                    texture: c.base.texture.raw(),
                    level: c.base.level,
                    layer: c.base.layer,
                }),
        );
        images.extend(self.depth.iter().map(rendered));
        images
    }
}

// ── Caches ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramebufferImage {
    Texture {
        texture: RawHandle,
        level: u8,
        layer: u16,
    },
    SwapChainImage {
        swap_chain: RawHandle,
        index: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub pass: u64,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub images: Vec<FramebufferImage>,
}

impl FramebufferKey {
    fn mentions(&self, texture: RawHandle) -> bool {
        self.images.iter().any(|image| {
            matches!(image, FramebufferImage::Texture { texture: t, .. } if *t == texture)
        })
    }
}

struct CachedPass<B: Backend> {
    id: u64,
    native: B::RenderPass,
    last_used: u64,
}

struct CachedFramebuffer<B: Backend> {
    native: B::Framebuffer,
    last_used: u64,
}

enum Doomed<B: Backend> {
    Pass(B::RenderPass),
    Framebuffer(B::Framebuffer),
}

/// Native render passes and framebuffers keyed by their content. Evicted
/// objects wait in a graveyard until the last buffer using them retires.
pub struct AttachmentCache<B: Backend> {
    passes: HashMap<RenderPassKey, CachedPass<B>>,
    framebuffers: HashMap<FramebufferKey, CachedFramebuffer<B>>,
    graveyard: Vec<(u64, Doomed<B>)>,
    next_pass_id: u64,
}

impl<B: Backend> Default for AttachmentCache<B> {
    fn default() -> Self {
        Self {
            passes: HashMap::new(),
            framebuffers: HashMap::new(),
            graveyard: Vec::new(),
            next_pass_id: 1,
        }
    }
}

impl<B: Backend> AttachmentCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of the cached pass for `key`, creating it on a miss.
    pub fn ensure_pass(
        &mut self,
        backend: &mut B,
        key: &RenderPassKey,
        seq: u64,
    ) -> Result<u64, BackendError> {
        if let Some(cached) = self.passes.get_mut(key) {
            cached.last_used = seq;
            return Ok(cached.id);
        }
        let native = backend.create_render_pass(key)?;
        let id = self.next_pass_id;
        self.next_pass_id += 1;
        debug!(
            "render pass {} created: {} colors, depth {:?}, {} samples",
            id,
            key.colors.len(),
            key.depth,
            key.samples
        );
        self.passes.insert(
            key.clone(),
            CachedPass {
                id,
                native,
                last_used: seq,
            },
        );
        Ok(id)
    }

    pub fn pass(&self, key: &RenderPassKey) -> Option<&B::RenderPass> {
        self.passes.get(key).map(|p| &p.native)
    }

    /// Makes sure a framebuffer for `key` is cached.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure_framebuffer(
        &mut self,
        backend: &mut B,
        pass_key: &RenderPassKey,
        key: &FramebufferKey,
        attachments: &[FramebufferAttachment<'_, B>],
        seq: u64,
    ) -> Result<(), BackendError> {
        if let Some(cached) = self.framebuffers.get_mut(key) {
            cached.last_used = seq;
            return Ok(());
        }
        let Some(pass) = self.passes.get(pass_key) else {
            panic!("framebuffer requested for an uncached render pass");
        };
        let native =
            backend.create_framebuffer(&pass.native, attachments, key.width, key.height, key.layers)?;
        trace!(
            "framebuffer {}x{} created for pass {}",
            key.width,
            key.height,
            key.pass
        );
        self.framebuffers.insert(
            key.clone(),
            CachedFramebuffer {
                native,
                last_used: seq,
            },
        );
        Ok(())
    }

    pub fn framebuffer(&self, key: &FramebufferKey) -> Option<&B::Framebuffer> {
        self.framebuffers.get(key).map(|f| &f.native)
    }

    /// Queues a framebuffer that was never cached (swap-chain passes).
    pub fn bury_framebuffer(&mut self, framebuffer: B::Framebuffer, last_used: u64) {
        self.graveyard
            .push((last_used, Doomed::Framebuffer(framebuffer)));
    }

    /// Evicts every framebuffer that renders into `texture`.
    pub fn evict_texture(&mut self, texture: RawHandle) {
        let doomed: Vec<FramebufferKey> = self
            .framebuffers
            .keys()
            .filter(|key| key.mentions(texture))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(cached) = self.framebuffers.remove(&key) {
                self.graveyard
                    .push((cached.last_used, Doomed::Framebuffer(cached.native)));
            }
        }
    }

    /// Evicts everything, e.g. after a resize.
    pub fn clear(&mut self) {
        let passes = self.passes.len();
        let framebuffers = self.framebuffers.len();
        for (_, cached) in self.framebuffers.drain() {
            self.graveyard
                .push((cached.last_used, Doomed::Framebuffer(cached.native)));
        }
        for (_, cached) in self.passes.drain() {
            self.graveyard
                .push((cached.last_used, Doomed::Pass(cached.native)));
        }
        debug!(
            "attachment cache cleared ({} passes, {} framebuffers)",
            passes, framebuffers
        );
    }

    /// Destroys evicted objects whose last use has retired. Framebuffers go
    /// before the passes they were created against.
    pub fn retire(&mut self, backend: &mut B, frontier: u64) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.graveyard)
            .into_iter()
            .partition(|(last_used, _)| *last_used <= frontier);
        self.graveyard = waiting;
        destroy_all(backend, ready.into_iter().map(|(_, doomed)| doomed));
    }

    /// Destroys everything immediately. The device must be idle.
    pub fn drain(&mut self, backend: &mut B) {
        self.clear();
        let doomed = std::mem::take(&mut self.graveyard);
        destroy_all(backend, doomed.into_iter().map(|(_, doomed)| doomed));
    }

    pub fn cached_passes(&self) -> usize {
        self.passes.len()
    }

    pub fn cached_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }
}

fn destroy_all<B: Backend>(backend: &mut B, doomed: impl Iterator<Item = Doomed<B>>) {
    let mut passes = Vec::new();
    for item in doomed {
        match item {
            Doomed::Framebuffer(native) => backend.destroy_framebuffer(native),
            Doomed::Pass(native) => passes.push(native),
        }
    }
    for native in passes {
        backend.destroy_render_pass(native);
    }
}
