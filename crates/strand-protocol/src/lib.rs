//! Vocabulary shared by the client recorder and the execution thread:
//! typed handles, resource descriptors and the generated operation list.

pub mod binding;
pub mod driver_api;
pub mod error;
pub mod handle;
pub mod pixel;
pub mod references;
pub mod types;

pub use binding::{
    BindingKind, DescriptorCounts, LayoutMask, SetLayoutBinding, SetLayoutDescriptor,
    ShaderStages, MAX_BINDINGS,
};
pub use driver_api::{
    Command, CommandEncoder, Dispatcher, DriverApi, Op, OpDescriptor, OpKind, Reply, Routine,
    OPERATIONS,
};
pub use error::ProtocolError;
pub use handle::{
    BufferHandle, DescriptorSetHandle, Handle, ProgramHandle, RawHandle, RenderTargetHandle,
    ResourceKind, SetLayoutHandle, SwapChainHandle, TextureHandle,
};
pub use pixel::{
    compute_data_size, compute_pixel_size, CompressedPixelDataType, PixelBufferDescriptor,
    PixelDataFormat, PixelDataType, PixelLayout,
};
pub use references::References;
pub use types::*;
