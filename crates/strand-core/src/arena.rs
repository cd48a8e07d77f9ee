//! Generation-checked resource arena with deferred destruction.
//!
//! The arena owns every resource record. Handles are slot indices plus a
//! generation, never addresses. A record stays alive while the client holds
//! it or another record links to it (render target -> attachments, set ->
//! occupants, texture -> multisample sidecar). Once nothing holds it, the
//! record is destroyed by `collect` only after the retirement frontier has
//! passed the last command buffer that used it.
//!
//! The client thread creates, releases and stamps records at encode time; the
//! execution thread reads descriptors, mutates texture state and collects.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use strand_protocol::handle::marker;
use strand_protocol::{
    BufferDescriptor, Handle, ProgramDescriptor, RawHandle, References, RenderTargetDescriptor,
    ResourceKind, SetLayoutDescriptor, SetLayoutHandle, SwapChainDescriptor, SwapChainHandle,
    TextureDescriptor, TextureHandle,
};

use crate::layout::ImageLayout;

/// Immutable creation-time description of a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceDescriptor {
    Texture(TextureDescriptor),
    Buffer(BufferDescriptor),
    SetLayout(SetLayoutDescriptor),
    DescriptorSet(DescriptorSetDescriptor),
    Program(ProgramDescriptor),
    RenderTarget(RenderTargetDescriptor),
    /// Render target drawing into the current image of a swap chain.
    SwapChainTarget(SwapChainHandle),
    SwapChain(SwapChainDescriptor),
}

impl ResourceDescriptor {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Texture(_) => ResourceKind::Texture,
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::SetLayout(_) => ResourceKind::SetLayout,
            Self::DescriptorSet(_) => ResourceKind::DescriptorSet,
            Self::Program(_) => ResourceKind::Program,
            Self::RenderTarget(_) | Self::SwapChainTarget(_) => ResourceKind::RenderTarget,
            Self::SwapChain(_) => ResourceKind::SwapChain,
        }
    }

    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        match self {
            Self::DescriptorSet(d) => d.layout.visit_handles(visit),
            Self::Program(d) => d.visit_handles(visit),
            Self::RenderTarget(d) => d.visit_handles(visit),
            Self::SwapChainTarget(s) => s.visit_handles(visit),
            Self::Texture(_) | Self::Buffer(_) | Self::SetLayout(_) | Self::SwapChain(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetDescriptor {
    pub layout: SetLayoutHandle,
}

/// Descriptor types the arena can create a typed handle from.
pub trait ArenaDescriptor {
    type Kind: marker::Kind;

    fn into_resource(self) -> ResourceDescriptor;
}

macro_rules! arena_descriptors {
    ($($ty:ty => $kind:ident :: $variant:ident),* $(,)?) => {
        $(
            impl ArenaDescriptor for $ty {
                type Kind = marker::$kind;

                fn into_resource(self) -> ResourceDescriptor {
                    ResourceDescriptor::$variant(self)
                }
            }
        )*
    };
}

arena_descriptors!(
    TextureDescriptor => Texture::Texture,
    BufferDescriptor => Buffer::Buffer,
    SetLayoutDescriptor => SetLayout::SetLayout,
    DescriptorSetDescriptor => DescriptorSet::DescriptorSet,
    ProgramDescriptor => Program::Program,
    RenderTargetDescriptor => RenderTarget::RenderTarget,
    SwapChainHandle => RenderTarget::SwapChainTarget,
    SwapChainDescriptor => SwapChain::SwapChain,
);

/// Mutable per-texture state, owned by the execution thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureState {
    /// Layout the image is in after the last recorded barrier.
    pub layout: ImageLayout,
    /// Final layout declared at the end of a render pass, applied lazily.
    pub declared: Option<ImageLayout>,
    /// Multisample twin. A back-reference only; the arena owns both.
    pub sidecar: Option<TextureHandle>,
}

/// A resource whose native object may now be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    pub handle: RawHandle,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub live: usize,
    pub pending: usize,
    pub slots: usize,
}

struct Entry {
    descriptor: ResourceDescriptor,
    client_refs: u32,
    link_refs: u32,
    /// Sequence number of the last command buffer that used the resource.
    last_use: u64,
    links: Vec<RawHandle>,
    occupants: BTreeMap<u8, RawHandle>,
    texture: TextureState,
}

impl Entry {
    fn refs(&self) -> u32 {
        self.client_refs + self.link_refs
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Unreferenced records waiting for the frontier to pass their last use.
    pending: Vec<RawHandle>,
}

impl ArenaInner {
    fn entry(&self, handle: RawHandle) -> &Entry {
        match self.slots.get(handle.index as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == handle.generation => entry,
            _ => stale(handle),
        }
    }

    fn entry_mut(&mut self, handle: RawHandle) -> &mut Entry {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == handle.generation => entry,
            _ => stale(handle),
        }
    }

    fn insert(&mut self, entry: Entry) -> RawHandle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                RawHandle::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                RawHandle::new(index, 0)
            }
        }
    }

    fn link(&mut self, child: RawHandle) {
        let entry = self.entry_mut(child);
        if entry.client_refs == 0 {
            destroyed(child);
        }
        entry.link_refs += 1;
    }

    fn unlink(&mut self, child: RawHandle, parent_last_use: u64) {
        let entry = self.entry_mut(child);
        entry.link_refs -= 1;
        entry.last_use = entry.last_use.max(parent_last_use);
        if entry.refs() == 0 {
            self.pending.push(child);
        }
    }
}

#[cold]
#[inline(never)]
fn stale(handle: RawHandle) -> ! {
    tracing::error!(%handle, "stale resource handle");
    panic!("stale resource handle {handle}: the resource was destroyed");
}

#[cold]
#[inline(never)]
fn destroyed(handle: RawHandle) -> ! {
    tracing::error!(%handle, "use of a destroyed resource");
    panic!("resource {handle} was destroyed and cannot be referenced again");
}

#[derive(Default)]
pub struct ResourceArena {
    inner: Mutex<ArenaInner>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Client side ─────────────────────────────────────────────────────

    /// Registers a resource held once by the client. Handles named by the
    /// descriptor (attachments, set layouts, ...) are linked and kept alive
    /// until this record is destroyed.
    pub fn create<D: ArenaDescriptor>(&self, descriptor: D) -> Handle<D::Kind> {
        let descriptor = descriptor.into_resource();
        let mut inner = self.inner.lock();

        let mut links = Vec::new();
        descriptor.visit_handles(&mut |raw| links.push(raw));
        for &child in &links {
            inner.link(child);
        }

        let kind = descriptor.kind();
        let handle = inner.insert(Entry {
            descriptor,
            client_refs: 1,
            link_refs: 0,
            last_use: 0,
            links,
            occupants: BTreeMap::new(),
            texture: TextureState::default(),
        });
        tracing::debug!(%handle, ?kind, "resource registered");
        Handle::from_raw(handle)
    }

    /// Adds a client reference. Retaining a destroyed resource is fatal.
    pub fn retain(&self, handle: RawHandle) {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(handle);
        if entry.client_refs == 0 {
            destroyed(handle);
        }
        entry.client_refs += 1;
    }

    /// Drops a client reference. When nothing holds the record any more it
    /// becomes pending and is destroyed once its last use retires.
    pub fn release(&self, handle: RawHandle) {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(handle);
        if entry.client_refs == 0 {
            destroyed(handle);
        }
        entry.client_refs -= 1;
        if entry.refs() == 0 {
            tracing::debug!(%handle, last_use = entry.last_use, "resource released");
            inner.pending.push(handle);
        }
    }

    /// Stamps explicitly referenced handles with the buffer being recorded.
    /// Every handle must still be held by the client.
    pub fn touch(&self, handles: &[RawHandle], seq: u64) {
        let mut inner = self.inner.lock();
        for &handle in handles {
            let entry = inner.entry_mut(handle);
            if entry.client_refs == 0 {
                destroyed(handle);
            }
            entry.last_use = entry.last_use.max(seq);
        }
    }

    /// Keeps a resource alive while it is part of bound state (a bound set,
    /// pipeline program or active render target), even after the client
    /// drops it. Binding a destroyed resource is fatal.
    pub fn hold_bound(&self, handle: RawHandle) {
        self.inner.lock().link(handle);
    }

    /// Ends a [`hold_bound`](Self::hold_bound). The resource stays in use
    /// up to the buffer `seq` in which it was unbound.
    pub fn drop_bound(&self, handle: RawHandle, seq: u64) {
        self.inner.lock().unlink(handle, seq);
    }

    /// Stamps resources used implicitly through bound state (sets and
    /// pipelines referenced by a draw). They are held while bound, so the
    /// client may already have dropped them.
    pub fn touch_bound(&self, handles: &[RawHandle], seq: u64) {
        let mut inner = self.inner.lock();
        for &handle in handles {
            let entry = inner.entry_mut(handle);
            entry.last_use = entry.last_use.max(seq);
        }
    }

    /// Places `child` in `slot` of `parent`, replacing the previous occupant.
    /// The previous occupant inherits the parent's last use, since native
    /// objects recorded up to that point may still reference it.
    pub fn occupy(&self, parent: RawHandle, slot: u8, child: RawHandle, seq: u64) {
        let mut inner = self.inner.lock();
        inner.link(child);
        let parent_entry = inner.entry_mut(parent);
        parent_entry.last_use = parent_entry.last_use.max(seq);
        let parent_last_use = parent_entry.last_use;
        let previous = parent_entry.occupants.insert(slot, child);
        if let Some(previous) = previous {
            inner.unlink(previous, parent_last_use);
        }
    }

    // ── Execution side ──────────────────────────────────────────────────

    /// Descriptor of a live resource. A stale handle is fatal.
    pub fn descriptor(&self, handle: RawHandle) -> ResourceDescriptor {
        self.inner.lock().entry(handle).descriptor.clone()
    }

    pub fn kind(&self, handle: RawHandle) -> ResourceKind {
        self.inner.lock().entry(handle).descriptor.kind()
    }

    pub fn texture_descriptor(&self, handle: TextureHandle) -> TextureDescriptor {
        match self.descriptor(handle.raw()) {
            ResourceDescriptor::Texture(descriptor) => descriptor,
            other => panic!("{} is a {:?}, not a texture", handle.raw(), other.kind()),
        }
    }

    pub fn is_live(&self, handle: RawHandle) -> bool {
        let inner = self.inner.lock();
        matches!(
            inner.slots.get(handle.index as usize),
            Some(Slot { generation, entry: Some(_) }) if *generation == handle.generation
        )
    }

    /// Runs `f` on a texture's descriptor and mutable state.
    pub fn with_texture<R>(
        &self,
        handle: TextureHandle,
        f: impl FnOnce(&TextureDescriptor, &mut TextureState) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(handle.raw());
        let Entry {
            descriptor,
            texture,
            ..
        } = entry;
        match descriptor {
            ResourceDescriptor::Texture(d) => f(d, texture),
            other => panic!("{} is a {:?}, not a texture", handle.raw(), other.kind()),
        }
    }

    /// Returns the multisample sidecar of `base`, creating its record on
    /// first use. The second value is `true` when the record is new and the
    /// caller must create the native object.
    pub fn sidecar(&self, base: TextureHandle, samples: u8) -> (TextureHandle, bool) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(base.raw());
        if let Some(existing) = entry.texture.sidecar {
            return (existing, false);
        }
        let descriptor = match &entry.descriptor {
            ResourceDescriptor::Texture(d) => d.multisample_twin(samples),
            other => panic!("{} is a {:?}, not a texture", base.raw(), other.kind()),
        };
        let last_use = entry.last_use;

        let sidecar = inner.insert(Entry {
            descriptor: ResourceDescriptor::Texture(descriptor),
            client_refs: 0,
            link_refs: 1,
            last_use,
            links: Vec::new(),
            occupants: BTreeMap::new(),
            texture: TextureState::default(),
        });
        let base_entry = inner.entry_mut(base.raw());
        base_entry.links.push(sidecar);
        base_entry.texture.sidecar = Some(TextureHandle::from_raw(sidecar));
        tracing::debug!(base = %base.raw(), %sidecar, samples, "multisample sidecar registered");
        (TextureHandle::from_raw(sidecar), true)
    }

    /// Destroys every unreferenced record whose last use is at or below
    /// `frontier`, cascading into the records it linked. Parents come before
    /// the children they kept alive.
    pub fn collect(&self, frontier: u64) -> Vec<Retired> {
        let mut inner = self.inner.lock();
        let mut retired = Vec::new();
        let mut waiting = Vec::new();
        let mut work = std::mem::take(&mut inner.pending);

        while let Some(handle) = work.pop() {
            if inner.entry(handle).last_use > frontier {
                waiting.push(handle);
                continue;
            }

            let slot = &mut inner.slots[handle.index as usize];
            let Some(entry) = slot.entry.take() else {
                stale(handle);
            };
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(handle.index);

            let kind = entry.descriptor.kind();
            tracing::debug!(%handle, ?kind, last_use = entry.last_use, frontier, "resource destroyed");
            retired.push(Retired { handle, kind });

            for child in entry.links.iter().chain(entry.occupants.values()) {
                inner.unlink(*child, entry.last_use);
            }
            work.append(&mut inner.pending);
        }

        inner.pending.extend(waiting);
        retired
    }

    /// Resources still waiting for retirement.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        let live = inner.slots.iter().filter(|s| s.entry.is_some()).count();
        ArenaStats {
            live,
            pending: inner.pending.len(),
            slots: inner.slots.len(),
        }
    }
}
