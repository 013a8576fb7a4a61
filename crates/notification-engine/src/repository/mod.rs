//! 数据访问层
//!
//! `traits` 定义引擎依赖的抽象，`memory` 提供基于 DashMap 的内存实现，
//! 供开发环境和测试使用。

pub mod memory;
mod traits;

pub use memory::{
    LoggingDigestMailer, MemoryDigestRepository, MemoryNotificationRepository,
    MemoryPreferenceRepository, StaticRecipientResolver,
};
pub use traits::*;
