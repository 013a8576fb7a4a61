//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化入口，确保各进程使用一致的日志格式和指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;

use crate::config::ObservabilityConfig;
use crate::error::Result;

/// 统一初始化可观测性
///
/// 只负责安装日志订阅器和注册指标描述；指标导出器由宿主进程按需安装，
/// 未安装时 metrics 宏记录的数据会被直接丢弃。
///
/// # Example
///
/// ```ignore
/// use notify_shared::{config::AppConfig, observability};
///
/// let config = AppConfig::load("notification-engine")?;
/// observability::init(&config.service_name, &config.observability)?;
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<()> {
    tracing::init(config)?;

    if config.metrics_enabled {
        metrics::describe_metrics(service_name);
    }

    info!(
        service = %service_name,
        log_level = %config.log_level,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Observability initialized"
    );

    Ok(())
}
