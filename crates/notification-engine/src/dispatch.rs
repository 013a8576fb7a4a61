//! 处理器执行
//!
//! 同步路径和队列刷新共用：按优先级顺序逐个执行处理器，遇到第一个错误即中止。

use std::time::Duration;

use tracing::{debug, error};

use crate::error::{EngineError, Result};
use crate::events::EventEnvelope;
use crate::registry::{EventRegistry, HandlerRegistration};

/// 执行事件的全部处理器，返回实际执行的处理器数
///
/// once 处理器在执行前被摘除，并发执行时只有摘除成功的一方会调用它
pub async fn run_handlers(
    registry: &EventRegistry,
    envelope: &EventEnvelope,
    timeout: Option<Duration>,
) -> Result<usize> {
    let handlers = registry.get_handlers(&envelope.event_name);
    let mut invoked = 0;

    for registration in handlers {
        if registration.once && !registry.claim(registration.id) {
            debug!(
                event = %envelope.event_name,
                handler = %registration.handler.name(),
                "once 处理器已被执行，跳过"
            );
            continue;
        }

        if let Err(e) = invoke(&registration, envelope, timeout).await {
            error!(
                event = %envelope.event_name,
                handler = %registration.handler.name(),
                error = %e,
                "事件处理器执行失败，中止后续处理器"
            );
            return Err(e);
        }
        invoked += 1;
    }

    Ok(invoked)
}

async fn invoke(
    registration: &HandlerRegistration,
    envelope: &EventEnvelope,
    timeout: Option<Duration>,
) -> Result<()> {
    let handler = &registration.handler;
    let Some(limit) = timeout else {
        return handler.handle(envelope).await;
    };

    match tokio::time::timeout(limit, handler.handle(envelope)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::HandlerTimeout {
            handler: handler.name().to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use crate::registry::{RegisterOptions, handler_fn};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn envelope(name: &str) -> EventEnvelope {
        EventEnvelope::new(name, json!({}), Priority::Normal)
    }

    #[tokio::test]
    async fn test_runs_in_priority_order() {
        let registry = EventRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let calls = calls.clone();
            let _ = registry
                .register(
                    "order.created",
                    handler_fn(name, move |_e| {
                        let calls = calls.clone();
                        async move {
                            calls.lock().push(name);
                            Ok(())
                        }
                    }),
                    RegisterOptions::default().with_priority(priority),
                )
                .unwrap();
        }

        let invoked = run_handlers(&registry, &envelope("order.created"), None)
            .await
            .unwrap();
        assert_eq!(invoked, 3);
        assert_eq!(*calls.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_error_stops_remaining_handlers() {
        let registry = EventRegistry::new();
        let calls = Arc::new(Mutex::new(0));

        let _ = registry
            .register(
                "payment.failed",
                handler_fn("boom", |_e| async { Err(EngineError::handler("boom", "故障")) }),
                RegisterOptions::default().with_priority(10),
            )
            .unwrap();
        let counter = calls.clone();
        let _ = registry
            .register(
                "payment.failed",
                handler_fn("after", move |_e| {
                    let counter = counter.clone();
                    async move {
                        *counter.lock() += 1;
                        Ok(())
                    }
                }),
                RegisterOptions::default(),
            )
            .unwrap();

        let result = run_handlers(&registry, &envelope("payment.failed"), None).await;
        assert!(matches!(result, Err(EngineError::HandlerFailed { .. })));
        assert_eq!(*calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_once_handler_claimed() {
        let registry = EventRegistry::new();
        let _ = registry
            .register(
                "user.registered",
                handler_fn("welcome", |_e| async { Ok(()) }),
                RegisterOptions::default().once(),
            )
            .unwrap();

        let first = run_handlers(&registry, &envelope("user.registered"), None).await.unwrap();
        let second = run_handlers(&registry, &envelope("user.registered"), None).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout() {
        let registry = EventRegistry::new();
        let _ = registry
            .register(
                "order.created",
                handler_fn("slow", |_e| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }),
                RegisterOptions::default(),
            )
            .unwrap();

        let result = run_handlers(
            &registry,
            &envelope("order.created"),
            Some(Duration::from_millis(500)),
        )
        .await;
        assert!(matches!(
            result,
            Err(EngineError::HandlerTimeout { timeout_ms: 500, .. })
        ));
    }
}
