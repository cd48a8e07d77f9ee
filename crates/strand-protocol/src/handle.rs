use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// An untyped, generation-checked identifier for an arena slot.
/// It never encodes an address: `index` names the slot and `generation`
/// detects reuse of that slot after the previous occupant was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    pub index: u32,
    pub generation: u32,
}

impl RawHandle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Which kind of resource an arena slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    Buffer,
    SetLayout,
    DescriptorSet,
    Program,
    RenderTarget,
    SwapChain,
}

/// Marker types giving [`Handle`] its static kind.
pub mod marker {
    use super::ResourceKind;

    pub trait Kind: 'static {
        const KIND: ResourceKind;
        const NAME: &'static str;
    }

    macro_rules! kinds {
        ($($name:ident),* $(,)?) => {
            $(
                #[derive(Debug)]
                pub enum $name {}

                impl Kind for $name {
                    const KIND: ResourceKind = ResourceKind::$name;
                    const NAME: &'static str = stringify!($name);
                }
            )*
        };
    }

    kinds!(Texture, Buffer, SetLayout, DescriptorSet, Program, RenderTarget, SwapChain);
}

/// A typed client-side handle. Stable for the lifetime of the resource;
/// using it after the resource was destroyed is a programming error.
pub struct Handle<K: marker::Kind> {
    raw: RawHandle,
    _kind: PhantomData<fn() -> K>,
}

impl<K: marker::Kind> Handle<K> {
    pub const fn from_raw(raw: RawHandle) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    pub const fn raw(&self) -> RawHandle {
        self.raw
    }

    pub const fn kind(&self) -> ResourceKind {
        K::KIND
    }
}

impl<K: marker::Kind> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: marker::Kind> Copy for Handle<K> {}

impl<K: marker::Kind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: marker::Kind> Eq for Handle<K> {}

impl<K: marker::Kind> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: marker::Kind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({})", K::NAME, self.raw)
    }
}

pub type TextureHandle = Handle<marker::Texture>;
pub type BufferHandle = Handle<marker::Buffer>;
pub type SetLayoutHandle = Handle<marker::SetLayout>;
pub type DescriptorSetHandle = Handle<marker::DescriptorSet>;
pub type ProgramHandle = Handle<marker::Program>;
pub type RenderTargetHandle = Handle<marker::RenderTarget>;
pub type SwapChainHandle = Handle<marker::SwapChain>;
