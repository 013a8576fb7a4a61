//! 事件中间件管道
//!
//! 同步 emit 路径上，处理器执行前依次经过固定顺序的横切阶段：
//! 日志 → 校验 → 去重 → 限流 → 偏好。
//!
//! 每个阶段返回显式的 [`Decision`]，`Halt` 即终止后续阶段且不执行处理器。
//! 阶段返回错误时整个管道中止，由调用方决定是否记为事件失败。
//! `after` 钩子按逆序执行，可观察最终结果（用于日志和计时）。

pub mod dedupe;
pub mod logging;
pub mod preferences;
pub mod rate_limit;
pub mod validation;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{EngineError, Result};
use crate::events::EventEnvelope;
use crate::models::ActorType;

pub use dedupe::DedupeMiddleware;
pub use logging::LoggingMiddleware;
pub use preferences::{PreferenceCache, PreferenceMiddleware};
pub use rate_limit::RateLimitMiddleware;
pub use validation::{EventSchema, SchemaRegistry, StaticSchemaRegistry, ValidationMiddleware};

/// 阶段决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Halt,
}

/// 管道中流转的事件上下文
#[derive(Debug, Clone)]
pub struct EventContext {
    pub envelope: EventEnvelope,
    /// 载荷中声明的通知对象，admin 上下文不做偏好过滤
    pub actor: Option<ActorType>,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    /// 非阻断的校验警告
    pub warnings: Vec<String>,
    pub started_at: Instant,
}

impl EventContext {
    pub fn new(envelope: EventEnvelope) -> Self {
        let actor = ["actorType", "actor"]
            .iter()
            .find_map(|key| envelope.payload_str(key))
            .and_then(|s| s.parse().ok());
        Self {
            envelope,
            actor,
            skipped: false,
            skip_reason: None,
            warnings: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.envelope.event_name
    }

    pub fn recipient(&self) -> Option<&str> {
        self.envelope.recipient.as_deref()
    }

    pub fn is_broadcast(&self) -> bool {
        self.envelope.recipient.is_none()
    }

    /// 标记跳过并返回 Halt
    pub fn skip(&mut self, reason: impl Into<String>) -> Decision {
        self.skipped = true;
        self.skip_reason = Some(reason.into());
        Decision::Halt
    }
}

/// 管道执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// 处理器已执行
    Completed { handlers: usize },
    /// 某阶段终止了管道，原因见 `EventContext::skip_reason`
    Halted { stage: String },
    /// 阶段或处理器失败
    Failed { error: String },
}

/// 中间件阶段
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, ctx: &mut EventContext) -> Result<Decision>;

    async fn after(&self, _ctx: &EventContext, _outcome: &PipelineOutcome) {}
}

/// 中间件管道
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加阶段，保持注册顺序
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.stages.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.stages.push(middleware);
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 依次执行各阶段，全部放行后调用 `final_handler`
    pub async fn execute<F, Fut>(&self, ctx: &mut EventContext, final_handler: F) -> Result<PipelineOutcome>
    where
        F: FnOnce(EventEnvelope) -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        let mut entered = 0;

        while entered < self.stages.len() {
            let stage = &self.stages[entered];
            entered += 1;

            match stage.before(ctx).await {
                Ok(Decision::Continue) if !ctx.skipped => {}
                Ok(_) => {
                    let outcome = PipelineOutcome::Halted {
                        stage: stage.name().to_string(),
                    };
                    self.run_after(entered, ctx, &outcome).await;
                    return Ok(outcome);
                }
                Err(e) => {
                    let err = EngineError::Middleware {
                        stage: stage.name().to_string(),
                        reason: e.to_string(),
                    };
                    let outcome = PipelineOutcome::Failed {
                        error: err.to_string(),
                    };
                    self.run_after(entered, ctx, &outcome).await;
                    return Err(err);
                }
            }
        }

        match final_handler(ctx.envelope.clone()).await {
            Ok(handlers) => {
                let outcome = PipelineOutcome::Completed { handlers };
                self.run_after(entered, ctx, &outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                let outcome = PipelineOutcome::Failed { error: e.to_string() };
                self.run_after(entered, ctx, &outcome).await;
                Err(e)
            }
        }
    }

    async fn run_after(&self, entered: usize, ctx: &EventContext, outcome: &PipelineOutcome) {
        for stage in self.stages[..entered].iter().rev() {
            stage.after(ctx, outcome).await;
        }
    }
}
