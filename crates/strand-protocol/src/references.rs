//! Enumerates the handles an encoded argument refers to, so the recorder can
//! stamp each referenced resource with the buffer that last uses it.

use crate::binding::SetLayoutDescriptor;
use crate::handle::{marker, Handle, RawHandle};
use crate::pixel::PixelBufferDescriptor;
use crate::types::*;

pub trait References {
    fn visit_handles(&self, _visit: &mut dyn FnMut(RawHandle)) {}
}

macro_rules! no_references {
    ($($ty:ty),* $(,)?) => {
        $(impl References for $ty {})*
    };
}

no_references!(
    bool,
    u8,
    u16,
    u32,
    u64,
    i32,
    f32,
    String,
    TextureDescriptor,
    BufferDescriptor,
    SetLayoutDescriptor,
    SwapChainDescriptor,
    PixelBufferDescriptor,
    SamplerParams,
    RenderPassParams,
    Rect2D,
    TextureFormat,
    TextureUsage,
);

impl<K: marker::Kind> References for Handle<K> {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        visit(self.raw());
    }
}

impl<T: References> References for Option<T> {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        if let Some(inner) = self {
            inner.visit_handles(visit);
        }
    }
}

impl<T: References> References for Vec<T> {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        for item in self {
            item.visit_handles(visit);
        }
    }
}

impl<T: References, const N: usize> References for [T; N] {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        for item in self {
            item.visit_handles(visit);
        }
    }
}

impl References for Attachment {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        self.texture.visit_handles(visit);
    }
}

impl References for RenderTargetDescriptor {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        self.color.visit_handles(visit);
        self.depth.visit_handles(visit);
    }
}

impl References for ProgramDescriptor {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        self.set_layouts.visit_handles(visit);
    }
}

impl References for PipelineState {
    fn visit_handles(&self, visit: &mut dyn FnMut(RawHandle)) {
        self.program.visit_handles(visit);
    }
}
