//! 通知引擎
//!
//! 对外提供两种入口：
//!
//! - `create`：按 actor 直接落库，一个接收人一条记录
//! - `emit`：事件驱动，经中间件管道后执行注册的处理器；
//!   非紧急的异步事件进入分层队列批量投递
//!
//! 引擎边界负责把内部错误转换为结构化结果，单个坏事件不会影响其他生产方。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use notify_shared::config::EngineConfig;
use notify_shared::observability::metrics;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::run_handlers;
use crate::error::{EngineError, Result};
use crate::events::EventEnvelope;
use crate::middleware::{
    DedupeMiddleware, EventContext, LoggingMiddleware, Pipeline, PipelineOutcome, PreferenceCache,
    PreferenceMiddleware, RateLimitMiddleware, SchemaRegistry, StaticSchemaRegistry,
    ValidationMiddleware,
};
use crate::models::{ActorType, NewNotification, NotificationRecord, Priority};
use crate::queue::{BatchOutcome, EnqueueOutcome, EventQueue, QueueStats};
use crate::registry::{EventHandler, EventRegistry, RegisterOptions, RegistryStats, Subscription};
use crate::repository::{
    MemoryPreferenceRepository, NotificationRepository, PreferenceRepository, RecipientQuery,
    RecipientResolver, StaticRecipientResolver,
};
use crate::tracker::{EventTracker, TrackedOutcome, TrackerStats};

/// 接收人
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// 由收件人解析器按 actor / 租户 / 角色解析
    Broadcast,
    One(String),
    Many(Vec<String>),
}

impl From<&str> for Recipients {
    fn from(email: &str) -> Self {
        Self::One(email.to_string())
    }
}

impl From<String> for Recipients {
    fn from(email: String) -> Self {
        Self::One(email)
    }
}

impl From<Vec<String>> for Recipients {
    fn from(emails: Vec<String>) -> Self {
        Self::Many(emails)
    }
}

impl From<Option<String>> for Recipients {
    fn from(email: Option<String>) -> Self {
        email.map_or(Self::Broadcast, Self::One)
    }
}

/// 创建通知请求
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub actor: ActorType,
    pub notification_type: String,
    pub recipients: Recipients,
    pub content: NewNotification,
    pub routing: Option<serde_json::Value>,
    pub tenant_id: Option<String>,
    /// 广播解析时的角色过滤
    pub roles: Vec<String>,
}

impl CreateRequest {
    pub fn new(
        actor: ActorType,
        notification_type: impl Into<String>,
        recipients: impl Into<Recipients>,
        content: NewNotification,
    ) -> Self {
        Self {
            actor,
            notification_type: notification_type.into(),
            recipients: recipients.into(),
            content,
            routing: None,
            tenant_id: None,
            roles: Vec::new(),
        }
    }

    pub fn with_routing(mut self, routing: serde_json::Value) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// emit 选项
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    pub priority: Priority,
    /// 非紧急事件进入队列异步投递
    pub async_dispatch: bool,
}

impl EmitOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// 按字符串设置优先级，未知取值降级为 normal
    pub fn with_priority_label(self, label: &str) -> Self {
        self.with_priority(Priority::parse_lenient(label))
    }

    pub fn queued(mut self) -> Self {
        self.async_dispatch = true;
        self
    }
}

/// emit 结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitResult {
    pub success: bool,
    pub queued: bool,
    pub skipped: bool,
    pub handlers: usize,
    /// no_handlers 或跳过原因
    pub reason: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl EmitResult {
    pub fn no_handlers() -> Self {
        Self {
            reason: Some("no_handlers".to_string()),
            ..Default::default()
        }
    }

    pub fn queued() -> Self {
        Self {
            success: true,
            queued: true,
            ..Default::default()
        }
    }

    /// 策略拒绝属于预期结果，success 仍为 true
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            skipped: true,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn completed(handlers: usize, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            handlers,
            warnings,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// 引擎统计快照
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub registry: RegistryStats,
    pub queue: QueueStats,
    pub tracker: TrackerStats,
}

/// 通知引擎
pub struct NotificationEngine {
    registry: EventRegistry,
    queue: EventQueue,
    pipeline: Pipeline,
    tracker: EventTracker,
    repositories: HashMap<ActorType, Arc<dyn NotificationRepository>>,
    resolver: Arc<dyn RecipientResolver>,
    preferences: PreferenceCache,
    handler_timeout: Option<Duration>,
}

impl NotificationEngine {
    pub fn builder() -> NotificationEngineBuilder {
        NotificationEngineBuilder::default()
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn tracker(&self) -> &EventTracker {
        &self.tracker
    }

    pub fn preferences(&self) -> &PreferenceCache {
        &self.preferences
    }

    pub fn repository(&self, actor: ActorType) -> Result<Arc<dyn NotificationRepository>> {
        self.repositories
            .get(&actor)
            .cloned()
            .ok_or(EngineError::RepositoryMissing(actor))
    }

    /// 直接创建通知
    ///
    /// 返回成功落库的记录，可能为空。单个接收人写入失败不影响其他接收人；
    /// 只有装配错误（actor 没有仓储）会返回 Err。
    #[instrument(skip(self, request), fields(actor = %request.actor, notification_type = %request.notification_type))]
    pub async fn create(&self, request: CreateRequest) -> Result<Vec<NotificationRecord>> {
        let repository = self.repository(request.actor)?;
        let recipients = self.resolve_recipients(&request).await;
        if recipients.is_empty() {
            warn!("没有可投递的接收人，未创建通知");
            return Ok(Vec::new());
        }

        let mut created = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut record =
                request
                    .content
                    .to_record(request.actor, recipient.clone(), &request.notification_type);
            record.tenant_id = request.tenant_id.clone();
            record.routing = request.routing.clone();

            match repository.create(&record).await {
                Ok(saved) => created.push(saved),
                Err(e) => warn!(
                    recipient = recipient.as_deref().unwrap_or("<broadcast>"),
                    error = %e,
                    "通知写入失败，继续处理其他接收人"
                ),
            }
        }

        metrics::record_notification_created(request.actor.as_str(), created.len());
        debug!(created = created.len(), "通知创建完成");
        Ok(created)
    }

    /// 解析接收人，None 表示广播记录
    async fn resolve_recipients(&self, request: &CreateRequest) -> Vec<Option<String>> {
        let emails = match &request.recipients {
            Recipients::One(email) => vec![email.clone()],
            Recipients::Many(emails) => emails.clone(),
            Recipients::Broadcast => {
                let query = RecipientQuery {
                    actor: request.actor,
                    tenant_id: request.tenant_id.clone(),
                    roles: request.roles.clone(),
                };
                let resolved = self.resolver.resolve(&query).await.unwrap_or_else(|e| {
                    warn!(error = %e, "广播收件人解析失败");
                    Vec::new()
                });
                if resolved.is_empty() {
                    return if request.actor.supports_broadcast() {
                        vec![None]
                    } else {
                        Vec::new()
                    };
                }
                resolved
            }
        };

        // 同一接收人只写一条
        let mut seen = HashSet::new();
        emails
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty() && seen.insert(e.to_ascii_lowercase()))
            .map(Some)
            .collect()
    }

    /// 批量创建，结果拍平；失败的请求只记录日志
    pub async fn bulk_create(&self, requests: Vec<CreateRequest>) -> Vec<NotificationRecord> {
        let results = join_all(requests.into_iter().map(|r| self.create(r))).await;
        results
            .into_iter()
            .filter_map(|r| {
                r.map_err(|e| warn!(error = %e, "批量创建中的请求失败"))
                    .ok()
            })
            .flatten()
            .collect()
    }

    /// 发布事件
    #[instrument(skip(self, event_name, payload), fields(event = %event_name.as_ref(), priority = %options.priority))]
    pub async fn emit(
        &self,
        event_name: impl AsRef<str>,
        payload: serde_json::Value,
        options: EmitOptions,
    ) -> EmitResult {
        let event_name = event_name.as_ref();
        let started = Instant::now();

        if !self.registry.has_handlers(event_name) {
            debug!("事件没有注册处理器");
            self.tracker
                .record(event_name, TrackedOutcome::NoHandlers, started.elapsed());
            return EmitResult::no_handlers();
        }

        let envelope = EventEnvelope::new(event_name, payload, options.priority);

        if options.async_dispatch && !options.priority.is_urgent() {
            return match self.queue.enqueue(envelope).await {
                Ok(EnqueueOutcome::Queued { .. }) => {
                    self.tracker
                        .record(event_name, TrackedOutcome::Queued, started.elapsed());
                    EmitResult::queued()
                }
                Ok(EnqueueOutcome::Processed { handlers }) => {
                    self.tracker
                        .record(event_name, TrackedOutcome::Success, started.elapsed());
                    EmitResult::completed(handlers, Vec::new())
                }
                Err(e) => {
                    self.tracker
                        .record_failure(event_name, &e.to_string(), started.elapsed());
                    EmitResult::failed(e.to_string())
                }
            };
        }

        let mut ctx = EventContext::new(envelope);
        let registry = self.registry.clone();
        let timeout = self.handler_timeout;
        let result = self
            .pipeline
            .execute(&mut ctx, |envelope| async move {
                run_handlers(&registry, &envelope, timeout).await
            })
            .await;

        match result {
            Ok(PipelineOutcome::Completed { handlers }) => {
                self.tracker
                    .record(event_name, TrackedOutcome::Success, started.elapsed());
                EmitResult::completed(handlers, ctx.warnings)
            }
            Ok(PipelineOutcome::Halted { stage }) => {
                self.tracker
                    .record(event_name, TrackedOutcome::Skipped, started.elapsed());
                EmitResult::skipped(ctx.skip_reason.unwrap_or(stage))
            }
            Ok(PipelineOutcome::Failed { error }) => {
                self.tracker
                    .record_failure(event_name, &error, started.elapsed());
                EmitResult::failed(error)
            }
            Err(e) => {
                self.tracker
                    .record_failure(event_name, &e.to_string(), started.elapsed());
                EmitResult::failed(e.to_string())
            }
        }
    }

    /// 注册处理器
    pub fn on(&self, event: impl AsRef<str>, handler: Arc<dyn EventHandler>) -> Result<Subscription> {
        self.registry.register(event, handler, RegisterOptions::default())
    }

    pub fn on_with(
        &self,
        event: impl AsRef<str>,
        handler: Arc<dyn EventHandler>,
        options: RegisterOptions,
    ) -> Result<Subscription> {
        self.registry.register(event, handler, options)
    }

    /// 注册只执行一次的处理器
    pub fn once(&self, event: impl AsRef<str>, handler: Arc<dyn EventHandler>) -> Result<Subscription> {
        self.registry
            .register(event, handler, RegisterOptions::default().once())
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            registry: self.registry.stats(),
            queue: self.queue.stats(),
            tracker: self.tracker.stats(),
        }
    }

    /// 关闭队列，`drain` 为 true 时执行完剩余事件
    pub async fn shutdown(&self, drain: bool) -> BatchOutcome {
        info!(drain, "通知引擎正在关闭");
        self.queue.shutdown(drain).await
    }
}

/// 引擎构建器
///
/// 未显式注入的组件按配置创建默认实现
#[derive(Default)]
pub struct NotificationEngineBuilder {
    config: EngineConfig,
    registry: Option<EventRegistry>,
    queue: Option<EventQueue>,
    pipeline: Option<Pipeline>,
    tracker: Option<EventTracker>,
    repositories: HashMap<ActorType, Arc<dyn NotificationRepository>>,
    resolver: Option<Arc<dyn RecipientResolver>>,
    preference_repository: Option<Arc<dyn PreferenceRepository>>,
    schemas: Option<Arc<dyn SchemaRegistry>>,
}

impl NotificationEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: EventRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 注入队列时需保证其使用同一个注册表
    pub fn with_queue(mut self, queue: EventQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_tracker(mut self, tracker: EventTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_repository(mut self, actor: ActorType, repository: Arc<dyn NotificationRepository>) -> Self {
        self.repositories.insert(actor, repository);
        self
    }

    /// 所有 actor 共用一个仓储
    pub fn with_shared_repository(mut self, repository: Arc<dyn NotificationRepository>) -> Self {
        for actor in ActorType::ALL {
            self.repositories.insert(actor, repository.clone());
        }
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RecipientResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_preference_repository(mut self, repository: Arc<dyn PreferenceRepository>) -> Self {
        self.preference_repository = Some(repository);
        self
    }

    pub fn with_schemas(mut self, schemas: Arc<dyn SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn build(self) -> NotificationEngine {
        let config = self.config;
        let handler_timeout = config.handler_timeout_ms.map(Duration::from_millis);

        let registry = self.registry.unwrap_or_default();
        let tracker = self
            .tracker
            .unwrap_or_else(|| EventTracker::new(config.tracker_error_samples));
        // 自定义队列需自行通过 EventQueue::with_tracker 接入追踪器
        let queue = self.queue.unwrap_or_else(|| {
            EventQueue::new(registry.clone(), config.queue.clone())
                .with_handler_timeout(handler_timeout)
                .with_tracker(tracker.clone())
        });

        let preference_repository = self.preference_repository.unwrap_or_else(|| {
            debug!("未注入偏好仓储，使用内存实现");
            Arc::new(MemoryPreferenceRepository::new())
        });
        let preferences = PreferenceCache::new(
            preference_repository,
            Duration::from_secs(config.preference_cache_ttl_secs),
        );

        let pipeline = self.pipeline.unwrap_or_else(|| {
            let schemas = self
                .schemas
                .unwrap_or_else(|| Arc::new(StaticSchemaRegistry::with_defaults()));
            standard_pipeline(&config, schemas, preferences.clone())
        });

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticRecipientResolver::new()));

        info!(
            stages = ?pipeline.stage_names(),
            repositories = self.repositories.len(),
            "通知引擎已构建"
        );

        NotificationEngine {
            registry,
            queue,
            pipeline,
            tracker,
            repositories: self.repositories,
            resolver,
            preferences,
            handler_timeout,
        }
    }
}

/// 标准管道：日志 → 校验 → 去重 → 限流 → 偏好
pub fn standard_pipeline(
    config: &EngineConfig,
    schemas: Arc<dyn SchemaRegistry>,
    preferences: PreferenceCache,
) -> Pipeline {
    Pipeline::new()
        .with(Arc::new(LoggingMiddleware))
        .with(Arc::new(ValidationMiddleware::new(schemas)))
        .with(Arc::new(DedupeMiddleware::new(&config.dedupe)))
        .with(Arc::new(RateLimitMiddleware::new(&config.rate_limit)))
        .with(Arc::new(PreferenceMiddleware::new(
            preferences,
            &config.critical_events,
        )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::handler_fn;
    use crate::repository::{MockNotificationRepository, MockRecipientResolver};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine_with(repo: MockNotificationRepository, resolver: MockRecipientResolver) -> NotificationEngine {
        NotificationEngine::builder()
            .with_shared_repository(Arc::new(repo))
            .with_resolver(Arc::new(resolver))
            .build()
    }

    #[tokio::test]
    async fn test_create_continues_past_failed_recipient() {
        let mut repo = MockNotificationRepository::new();
        repo.expect_create().times(3).returning(|record| {
            if record.recipient_email.as_deref() == Some("bad@example.com") {
                Err(EngineError::Persistence("constraint violation".to_string()))
            } else {
                Ok(record.clone())
            }
        });
        let engine = engine_with(repo, MockRecipientResolver::new());

        let request = CreateRequest::new(
            ActorType::Client,
            "order_placed",
            vec![
                "a@example.com".to_string(),
                "bad@example.com".to_string(),
                "b@example.com".to_string(),
            ],
            NewNotification::new("下单成功", "订单已创建"),
        );
        let created = engine.create(request).await.unwrap();

        let recipients: Vec<_> = created.iter().filter_map(|r| r.recipient_email.as_deref()).collect();
        assert_eq!(recipients, vec!["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn test_create_dedupes_recipients() {
        let mut repo = MockNotificationRepository::new();
        repo.expect_create().times(1).returning(|r| Ok(r.clone()));
        let engine = engine_with(repo, MockRecipientResolver::new());

        let request = CreateRequest::new(
            ActorType::Client,
            "order_placed",
            vec!["a@example.com".to_string(), " A@example.com ".to_string(), "".to_string()],
            NewNotification::new("t", "m"),
        );
        assert_eq!(engine.create(request).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_client_without_recipients_creates_nothing() {
        let mut repo = MockNotificationRepository::new();
        repo.expect_create().never();
        let mut resolver = MockRecipientResolver::new();
        resolver.expect_resolve().returning(|_| Ok(vec![]));
        let engine = engine_with(repo, resolver);

        let request = CreateRequest::new(ActorType::Client, "promo", Recipients::Broadcast, NewNotification::new("t", "m"));
        assert!(engine.create(request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_resolves_with_tenant_and_roles() {
        let mut repo = MockNotificationRepository::new();
        repo.expect_create().times(2).returning(|r| Ok(r.clone()));
        let mut resolver = MockRecipientResolver::new();
        resolver
            .expect_resolve()
            .withf(|q| q.actor == ActorType::Tenant && q.tenant_id.as_deref() == Some("t-1") && q.roles == vec!["owner"])
            .returning(|_| Ok(vec!["o1@example.com".to_string(), "o2@example.com".to_string()]));
        let engine = engine_with(repo, resolver);

        let request = CreateRequest::new(ActorType::Tenant, "new_review", Recipients::Broadcast, NewNotification::new("t", "m"))
            .with_tenant("t-1")
            .with_roles(vec!["owner".to_string()]);
        let created = engine.create(request).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|r| r.tenant_id.as_deref() == Some("t-1")));
    }

    #[tokio::test]
    async fn test_create_without_repository_is_configuration_error() {
        let engine = NotificationEngine::builder().build();
        let request = CreateRequest::new(ActorType::Admin, "x", "a@example.com", NewNotification::new("t", "m"));
        let err = engine.create(request).await.unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_emit_sync_failure_is_reported_not_propagated() {
        let engine = NotificationEngine::builder().build();
        let _ = engine
            .on(
                "payment.failed",
                handler_fn("broken", |_e| async { Err(EngineError::handler("broken", "下游不可用")) }),
            )
            .unwrap();

        let result = engine
            .emit("payment.failed", json!({"userEmail": "a@example.com"}), EmitOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("下游不可用"));

        let errors = engine.tracker().recent_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event_name, "payment.failed");
    }

    #[tokio::test]
    async fn test_async_high_priority_is_queued() {
        let engine = NotificationEngine::builder().build();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _ = engine
            .on(
                "order.created",
                handler_fn("count", move |_e| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let result = engine
            .emit(
                "order.created",
                json!({"orderId": "o1"}),
                EmitOptions::default().with_priority(Priority::High).queued(),
            )
            .await;
        assert_eq!(result, EmitResult::queued());
        assert_eq!(engine.queue().stats().high, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let batch = engine.shutdown(true).await;
        assert_eq!(batch.processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_priority_label_routes_emit() {
        let engine = NotificationEngine::builder().build();
        let _ = engine
            .on("order.created", handler_fn("noop", |_e| async { Ok(()) }))
            .unwrap();

        let urgent = engine
            .emit(
                "order.created",
                json!({"orderId": "o1"}),
                EmitOptions::default().with_priority_label("URGENT").queued(),
            )
            .await;
        assert!(!urgent.queued);
        assert_eq!(urgent.handlers, 1);

        // 未知取值按 normal 排队
        let unknown = engine
            .emit(
                "order.created",
                json!({"orderId": "o2"}),
                EmitOptions::default().with_priority_label("asap").queued(),
            )
            .await;
        assert!(unknown.queued);
        assert_eq!(engine.queue().stats().normal, 1);
        engine.shutdown(false).await;
    }
}
