//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型（配置、可观测性等），使用 thiserror 提供良好的错误信息。
//! 领域错误由各业务 crate 自行定义，并通过 `#[from]` 包装本类型。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum SharedError {
    // ==================== 配置错误 ====================
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("无效的配置项: {field} - {message}")]
    InvalidConfig { field: String, message: String },

    // ==================== 可观测性错误 ====================
    #[error("日志初始化失败: {0}")]
    Observability(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;

impl SharedError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Observability(_) => "OBSERVABILITY_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 配置类错误重试无意义，需要人工修正
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = SharedError::InvalidConfig {
            field: "engine.queue.batch_size".to_string(),
            message: "必须大于 0".to_string(),
        };
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SharedError::InvalidConfig {
            field: "digest.cron".to_string(),
            message: "表达式无效".to_string(),
        };
        assert_eq!(err.to_string(), "无效的配置项: digest.cron - 表达式无效");
    }
}
