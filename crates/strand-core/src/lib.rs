pub mod arena;
pub mod config;
pub mod coords;
pub mod error;
pub mod layout;
pub mod timeline;

pub use arena::{
    ArenaDescriptor, ArenaStats, DescriptorSetDescriptor, ResourceArena, ResourceDescriptor,
    Retired, TextureState,
};
pub use config::StrandConfig;
pub use error::CoreError;
pub use layout::{reduce_sample_count, ImageLayout};
pub use timeline::{FenceStatus, Timeline};
