pub mod attachments;
pub mod backend;
pub mod backends;
pub mod binding_cache;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod queue;
pub mod stream;

pub use backend::Backend;
pub use backends::headless::{HeadlessBackend, HeadlessProbe, NativeCall};
pub use backends::vulkan::VulkanBackend;
pub use engine::Engine;
pub use error::{AcquireError, BackendError, DriverError};
