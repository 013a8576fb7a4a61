//! 共享库
//!
//! 包含通知引擎各进程共用的配置加载、错误处理和可观测性基础设施代码。

pub mod config;
pub mod error;
pub mod observability;
