//! 通知引擎错误类型
//!
//! 定义事件注册、处理器执行、持久化和摘要发送等场景的错误分类，
//! 便于上层根据错误类型决定重试或丢弃策略。

use thiserror::Error;

use crate::models::ActorType;

/// 通知引擎错误类型
#[derive(Debug, Error)]
pub enum EngineError {
    // === 配置错误 ===
    #[error("无效的通知对象类型: {0}")]
    InvalidActor(String),

    #[error("无效的事件模式: {pattern} - {reason}")]
    InvalidEventPattern { pattern: String, reason: String },

    #[error("未注册通知仓储: actor={0}")]
    RepositoryMissing(ActorType),

    // === 处理器错误 ===
    #[error("事件处理器执行失败: handler={handler}, 原因={reason}")]
    HandlerFailed { handler: String, reason: String },

    #[error("事件处理器执行超时: handler={handler}, timeout_ms={timeout_ms}")]
    HandlerTimeout { handler: String, timeout_ms: u64 },

    #[error("中间件执行失败: stage={stage}, 原因={reason}")]
    Middleware { stage: String, reason: String },

    // === 队列错误 ===
    #[error("事件队列已满: tier={tier}")]
    QueueFull { tier: String },

    #[error("事件队列已关闭")]
    QueueClosed,

    // === 持久化与投递错误 ===
    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("记录不存在: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("邮件发送失败: {0}")]
    Mail(String),

    // === 系统错误 ===
    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Shared(#[from] notify_shared::error::SharedError),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 通知引擎 Result 类型别名
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// 便捷构造处理器失败
    pub fn handler(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandlerFailed {
            handler: handler.into(),
            reason: reason.into(),
        }
    }

    /// 检查是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Mail(_) | Self::HandlerTimeout { .. } | Self::QueueFull { .. }
        )
    }

    /// 检查是否为配置错误（调用方参数或装配问题，重试无意义）
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidActor(_) | Self::InvalidEventPattern { .. } | Self::RepositoryMissing(_)
        )
    }

    /// 获取错误码（用于追踪样本和结构化结果）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidActor(_) => "INVALID_ACTOR",
            Self::InvalidEventPattern { .. } => "INVALID_EVENT_PATTERN",
            Self::RepositoryMissing(_) => "REPOSITORY_MISSING",
            Self::HandlerFailed { .. } => "HANDLER_FAILED",
            Self::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            Self::Middleware { .. } => "MIDDLEWARE_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Mail(_) => "MAIL_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Shared(_) => "SHARED_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
