//! 通知事件引擎
//!
//! 进程内的事件总线与通知持久化引擎：
//! - 事件注册与通配符匹配（[`registry`]）
//! - 中间件流水线：日志、校验、去重、限流、用户偏好（[`middleware`]）
//! - 按优先级分层的异步队列（[`queue`]）
//! - 按 actor 路由的通知持久化（[`engine`]）
//! - 低优先级通知的摘要合并与定时发送（[`digest`]、[`worker`]）
//!
//! 业务侧通常只使用 [`facade::NotificationServiceFacade`]。

pub mod digest;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod facade;
pub mod middleware;
pub mod models;
pub mod priority;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod tracker;
pub mod worker;

pub use digest::DigestService;
pub use engine::{
    CreateRequest, EmitOptions, EmitResult, EngineStats, NotificationEngine,
    NotificationEngineBuilder, Recipients,
};
pub use error::{EngineError, Result};
pub use events::{EventEnvelope, EventKind, EventPattern};
pub use facade::{NotificationServiceFacade, NotifyOutcome};
pub use registry::{EventHandler, EventRegistry, RegisterOptions, Subscription, handler_fn};
pub use worker::{DigestWorker, WorkerHandle};
