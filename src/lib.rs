pub mod social;

// 重新导出常用类型，方便外部使用
pub use social::{
    client::{ActiveSession, SocialClient},
    config::ClientConfig,
    error::{SocialError, StoreError},
    memory::MemoryBackend,
    Backend,
};
