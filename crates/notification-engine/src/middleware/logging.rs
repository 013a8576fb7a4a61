//! 日志阶段：记录事件进入管道的时间和总耗时

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Decision, EventContext, Middleware, PipelineOutcome};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(&self, ctx: &mut EventContext) -> Result<Decision> {
        debug!(
            event = %ctx.event_name(),
            priority = %ctx.envelope.priority,
            recipient = ctx.recipient().unwrap_or("<broadcast>"),
            emitted_at = %ctx.envelope.emitted_at.to_rfc3339(),
            "事件进入处理管道"
        );
        Ok(Decision::Continue)
    }

    async fn after(&self, ctx: &EventContext, outcome: &PipelineOutcome) {
        let duration_ms = ctx.started_at.elapsed().as_millis() as u64;
        match outcome {
            PipelineOutcome::Completed { handlers } => info!(
                event = %ctx.event_name(),
                handlers,
                duration_ms,
                warnings = ctx.warnings.len(),
                "事件处理完成"
            ),
            PipelineOutcome::Halted { stage } => debug!(
                event = %ctx.event_name(),
                stage = %stage,
                reason = ctx.skip_reason.as_deref().unwrap_or_default(),
                duration_ms,
                "事件被跳过"
            ),
            PipelineOutcome::Failed { error } => warn!(
                event = %ctx.event_name(),
                error = %error,
                duration_ms,
                "事件处理失败"
            ),
        }
    }
}
