//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 所有配置项都带有默认值，缺省的配置文件不会导致启动失败。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::{Result, SharedError};

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 事件队列配置
///
/// 各优先级层独立刷新，间隔越短延迟越低
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// high 层刷新间隔（毫秒）
    pub high_interval_ms: u64,
    /// normal 层刷新间隔（毫秒）
    pub normal_interval_ms: u64,
    /// low 层刷新间隔（毫秒）
    pub low_interval_ms: u64,
    /// 每次刷新最多取出的事件数
    pub batch_size: usize,
    /// 单层最大积压数，超出后拒绝入队
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_interval_ms: 100,
            normal_interval_ms: 1_000,
            low_interval_ms: 5_000,
            batch_size: 10,
            max_depth: 10_000,
        }
    }
}

/// 去重配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub window_secs: u64,
    /// 始终投递、不参与去重的事件
    pub bypass_events: Vec<String>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            bypass_events: vec![
                "chat.message".to_string(),
                "message.received".to_string(),
                "auth.otp_requested".to_string(),
                "system.test".to_string(),
            ],
        }
    }
}

/// 限流配置
///
/// 三个计数器相互独立：接收人、事件类型、全局
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub per_recipient: u32,
    pub per_event_type: u32,
    pub global: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            per_recipient: 30,
            per_event_type: 100,
            global: 500,
        }
    }
}

/// 通知引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub dedupe: DedupeConfig,
    pub rate_limit: RateLimitConfig,
    /// 关键事件白名单：跳过偏好过滤和摘要合并（下划线形式，如 payment_failed）
    pub critical_events: Vec<String>,
    /// 用户偏好缓存 TTL（秒）
    pub preference_cache_ttl_secs: u64,
    /// 事件追踪保留的最近错误样本数
    pub tracker_error_samples: usize,
    /// 单个处理器执行超时（毫秒），未配置时不限制
    pub handler_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            dedupe: DedupeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            critical_events: vec![
                "payment_failed".to_string(),
                "order_cancelled".to_string(),
                "refund_failed".to_string(),
                "security_alert".to_string(),
                "account_suspended".to_string(),
                "password_reset".to_string(),
            ],
            preference_cache_ttl_secs: 300,
            tracker_error_samples: 20,
            handler_timeout_ms: None,
        }
    }
}

/// 摘要配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// 摘要批处理的 cron 表达式（含秒字段）
    pub cron: String,
    /// 无偏好记录时的默认发送时间（HH:MM，UTC）
    pub default_time: String,
    /// 无偏好记录时的默认星期（0 = 周日）
    pub default_day_of_week: u32,
    /// 每个分组保留的示例标题数
    pub sample_titles: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            cron: "0 */5 * * * *".to_string(),
            default_time: "09:00".to_string(),
            default_day_of_week: 1,
            sample_titles: 3,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub observability: ObservabilityConfig,
    pub engine: EngineConfig,
    pub digest: DigestConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（NOTIFY_ 前缀，双下划线分隔层级，如 NOTIFY_ENGINE__QUEUE__BATCH_SIZE）
    pub fn load(service_name: &str) -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("NOTIFY_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 校验配置的取值范围
    ///
    /// 反序列化只保证类型正确，这里补充业务约束
    pub fn validate(&self) -> Result<()> {
        let queue = &self.engine.queue;
        if queue.batch_size == 0 {
            return Err(invalid("engine.queue.batch_size", "必须大于 0"));
        }
        if queue.high_interval_ms == 0 || queue.normal_interval_ms == 0 || queue.low_interval_ms == 0 {
            return Err(invalid("engine.queue.*_interval_ms", "刷新间隔必须大于 0"));
        }
        if self.engine.dedupe.window_secs == 0 {
            return Err(invalid("engine.dedupe.window_secs", "必须大于 0"));
        }
        if self.engine.rate_limit.window_secs == 0 {
            return Err(invalid("engine.rate_limit.window_secs", "必须大于 0"));
        }
        if self.digest.default_day_of_week > 6 {
            return Err(invalid("digest.default_day_of_week", "取值范围 0-6"));
        }
        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn invalid(field: &str, message: &str) -> SharedError {
    SharedError::InvalidConfig {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.queue.batch_size, 10);
        assert_eq!(config.engine.queue.high_interval_ms, 100);
        assert_eq!(config.engine.queue.normal_interval_ms, 1_000);
        assert_eq!(config.engine.queue.low_interval_ms, 5_000);
        assert_eq!(config.engine.rate_limit.per_recipient, 30);
        assert_eq!(config.engine.rate_limit.per_event_type, 100);
        assert_eq!(config.engine.rate_limit.global, 500);
        assert_eq!(config.engine.dedupe.window_secs, 60);
        assert!(config.engine.handler_timeout_ms.is_none());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = AppConfig::default();
        config.engine.queue.batch_size = 0;

        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_validate_rejects_bad_weekday() {
        let mut config = AppConfig::default();
        config.digest.default_day_of_week = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_files_falls_back_to_defaults() {
        // 配置目录不存在时所有文件都是可选的
        let config = AppConfig::load("notification-engine").unwrap();
        assert_eq!(config.service_name, "notification-engine");
        assert_eq!(config.engine.queue.batch_size, 10);
    }

    #[test]
    fn test_observability_format() {
        let mut config = ObservabilityConfig::default();
        assert!(!config.is_json());
        config.log_format = "JSON".to_string();
        assert!(config.is_json());
    }
}
