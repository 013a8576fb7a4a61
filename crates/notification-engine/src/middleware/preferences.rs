//! 偏好阶段与偏好缓存
//!
//! 广播、admin 上下文和关键事件不做偏好过滤；其余事件查询接收人偏好，
//! 分类关闭或事件被屏蔽时终止投递。payload 带 `type` 字段时（例如投递事件
//! 携带的通知记录）按通知类型判断，否则按事件名判断。
//!
//! ## 缓存策略
//!
//! 偏好按用户缓存（默认 5 分钟 TTL），"无记录"同样缓存。
//! 偏好变更时由写入方调用 [`PreferenceCache::invalidate`]。
//! 条目数超过阈值后，写入前顺带清理过期条目。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Decision, EventContext, Middleware};
use crate::error::Result;
use crate::models::{ActorType, NotificationCategory, PreferenceRecord};
use crate::repository::PreferenceRepository;

/// 缓存条目超过该数量时清理过期条目
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
struct CachedPreference {
    value: Option<PreferenceRecord>,
    fetched_at: Instant,
}

/// 用户偏好缓存
///
/// 克隆共享同一份缓存，中间件和门面各持一份
#[derive(Clone)]
pub struct PreferenceCache {
    repository: Arc<dyn PreferenceRepository>,
    entries: Arc<DashMap<String, CachedPreference>>,
    ttl: Duration,
}

impl PreferenceCache {
    pub fn new(repository: Arc<dyn PreferenceRepository>, ttl: Duration) -> Self {
        Self {
            repository,
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// 查询偏好，缓存未命中或过期时回源
    pub async fn get(&self, user_email: &str) -> Result<Option<PreferenceRecord>> {
        let key = user_email.to_ascii_lowercase();
        if let Some(cached) = self.entries.get(&key) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.value.clone());
            }
        }

        // 回源期间不持有缓存锁
        let value = self.repository.get(user_email).await?;
        if self.entries.len() > PRUNE_THRESHOLD {
            self.prune_expired();
        }
        self.entries.insert(
            key,
            CachedPreference {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// 写入偏好并使缓存失效
    pub async fn upsert(&self, record: &PreferenceRecord) -> Result<PreferenceRecord> {
        let saved = self.repository.upsert(record).await?;
        self.invalidate(&record.user_email);
        Ok(saved)
    }

    /// 移除已过期的条目，返回移除数量
    pub fn prune_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.fetched_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "清理过期偏好缓存");
        }
        removed
    }

    pub fn invalidate(&self, user_email: &str) {
        self.entries.remove(&user_email.to_ascii_lowercase());
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct PreferenceMiddleware {
    cache: PreferenceCache,
    /// 下划线形式的关键事件名
    critical_events: HashSet<String>,
}

impl PreferenceMiddleware {
    pub fn new(cache: PreferenceCache, critical_events: &[String]) -> Self {
        Self {
            cache,
            critical_events: critical_events.iter().map(|e| e.replace('.', "_")).collect(),
        }
    }

    fn is_critical(&self, event_name: &str) -> bool {
        self.critical_events.contains(&event_name.replace('.', "_"))
    }
}

#[async_trait]
impl Middleware for PreferenceMiddleware {
    fn name(&self) -> &str {
        "preferences"
    }

    async fn before(&self, ctx: &mut EventContext) -> Result<Decision> {
        let Some(recipient) = ctx.recipient().map(str::to_string) else {
            return Ok(Decision::Continue);
        };
        let notification_type = ctx
            .envelope
            .payload_str("type")
            .unwrap_or(ctx.event_name())
            .to_string();
        if ctx.actor == Some(ActorType::Admin) || self.is_critical(&notification_type) {
            return Ok(Decision::Continue);
        }

        let preference = match self.cache.get(&recipient).await {
            Ok(Some(pref)) => pref,
            Ok(None) => return Ok(Decision::Continue),
            Err(e) => {
                // 偏好不可用时放行，避免丢通知
                warn!(recipient = %recipient, error = %e, "查询用户偏好失败，按默认偏好投递");
                ctx.warnings.push(format!("偏好查询失败: {e}"));
                return Ok(Decision::Continue);
            }
        };

        let category = NotificationCategory::from_type(&notification_type);
        if preference.is_category_disabled(category) {
            debug!(event = %ctx.event_name(), notification_type = %notification_type, recipient = %recipient, category = %category, "用户关闭了该分类");
            return Ok(ctx.skip("preference_disabled"));
        }
        if preference.is_muted(&notification_type) {
            debug!(event = %ctx.event_name(), notification_type = %notification_type, recipient = %recipient, "用户屏蔽了该事件");
            return Ok(ctx.skip("event_muted"));
        }

        Ok(Decision::Continue)
    }
}
