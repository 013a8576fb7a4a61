//! 限流阶段
//!
//! 三个独立的固定窗口计数器：接收人、事件类型、全局。
//! 先检查全部计数器，只有全部放行时才同时递增，被拒绝的事件不占用额度。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use notify_shared::config::RateLimitConfig;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{Decision, EventContext, Middleware};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: Instant,
    count: u32,
}

impl Counter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// 当前窗口内的计数，窗口过期时归零
    fn current(&mut self, now: Instant, window: Duration) -> u32 {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
        self.count
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) >= window
    }
}

struct Counters {
    recipients: HashMap<String, Counter>,
    events: HashMap<String, Counter>,
    global: Counter,
}

pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    window: Duration,
    counters: Mutex<Counters>,
}

impl RateLimitMiddleware {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            config: config.clone(),
            window: Duration::from_secs(config.window_secs),
            counters: Mutex::new(Counters {
                recipients: HashMap::new(),
                events: HashMap::new(),
                global: Counter::new(Instant::now()),
            }),
        }
    }

    /// 检查并占用额度，被拒绝时返回跳过原因
    fn acquire(&self, event_name: &str, recipient: Option<&str>) -> Option<&'static str> {
        let now = Instant::now();
        let window = self.window;
        let mut counters = self.counters.lock();
        let Counters {
            recipients,
            events,
            global,
        } = &mut *counters;

        // 计数器数量超过上限时清掉过期项
        if recipients.len() > 10_000 {
            recipients.retain(|_, c| !c.is_expired(now, window));
        }
        if events.len() > 1_000 {
            events.retain(|_, c| !c.is_expired(now, window));
        }

        if let Some(recipient) = recipient {
            let counter = recipients
                .entry(recipient.to_ascii_lowercase())
                .or_insert_with(|| Counter::new(now));
            if counter.current(now, window) >= self.config.per_recipient {
                return Some("rate_limit_recipient");
            }
        }

        let event_counter = events
            .entry(event_name.to_string())
            .or_insert_with(|| Counter::new(now));
        if event_counter.current(now, window) >= self.config.per_event_type {
            return Some("rate_limit_event");
        }

        if global.current(now, window) >= self.config.global {
            return Some("rate_limit_global");
        }

        if let Some(recipient) = recipient {
            if let Some(counter) = recipients.get_mut(&recipient.to_ascii_lowercase()) {
                counter.count += 1;
            }
        }
        event_counter.count += 1;
        global.count += 1;
        None
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn before(&self, ctx: &mut EventContext) -> Result<Decision> {
        match self.acquire(&ctx.envelope.event_name, ctx.envelope.recipient.as_deref()) {
            Some(reason) => {
                debug!(event = %ctx.event_name(), recipient = ?ctx.recipient(), reason, "触发限流，事件被跳过");
                Ok(ctx.skip(reason))
            }
            None => Ok(Decision::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEnvelope;
    use crate::models::Priority;
    use serde_json::json;

    fn ctx(event: &str, recipient: &str) -> EventContext {
        EventContext::new(EventEnvelope::new(event, json!({"userEmail": recipient}), Priority::Normal))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recipient_limit_then_window_reset() {
        let stage = RateLimitMiddleware::new(&RateLimitConfig::default());

        for _ in 0..30 {
            let mut c = ctx("order.shipped", "a@example.com");
            assert_eq!(stage.before(&mut c).await.unwrap(), Decision::Continue);
        }
        let mut over = ctx("order.shipped", "a@example.com");
        assert_eq!(stage.before(&mut over).await.unwrap(), Decision::Halt);
        assert_eq!(over.skip_reason.as_deref(), Some("rate_limit_recipient"));

        // 其他接收人不受影响
        let mut other = ctx("order.shipped", "b@example.com");
        assert_eq!(stage.before(&mut other).await.unwrap(), Decision::Continue);

        tokio::time::advance(Duration::from_secs(60)).await;
        let mut after_window = ctx("order.shipped", "a@example.com");
        assert_eq!(stage.before(&mut after_window).await.unwrap(), Decision::Continue);
    }

    #[tokio::test]
    async fn test_event_type_limit() {
        let config = RateLimitConfig {
            per_event_type: 3,
            ..Default::default()
        };
        let stage = RateLimitMiddleware::new(&config);

        for i in 0..3 {
            let mut c = ctx("review.created", &format!("u{i}@example.com"));
            assert_eq!(stage.before(&mut c).await.unwrap(), Decision::Continue);
        }
        let mut over = ctx("review.created", "u9@example.com");
        stage.before(&mut over).await.unwrap();
        assert_eq!(over.skip_reason.as_deref(), Some("rate_limit_event"));

        let mut other_event = ctx("order.created", "u9@example.com");
        assert_eq!(stage.before(&mut other_event).await.unwrap(), Decision::Continue);
    }

    #[tokio::test]
    async fn test_global_limit_and_rejected_do_not_consume() {
        let config = RateLimitConfig {
            global: 2,
            ..Default::default()
        };
        let stage = RateLimitMiddleware::new(&config);

        let mut a = ctx("a.x", "a@example.com");
        let mut b = ctx("b.x", "b@example.com");
        let mut c = ctx("c.x", "c@example.com");
        stage.before(&mut a).await.unwrap();
        stage.before(&mut b).await.unwrap();
        stage.before(&mut c).await.unwrap();
        assert_eq!(c.skip_reason.as_deref(), Some("rate_limit_global"));

        // 被全局限流拒绝的事件不计入接收人额度
        let counters = stage.counters.lock();
        assert_eq!(counters.recipients.get("c@example.com").map(|c| c.count), Some(0));
        assert_eq!(counters.global.count, 2);
    }

    #[tokio::test]
    async fn test_broadcast_only_counts_event_and_global() {
        let stage = RateLimitMiddleware::new(&RateLimitConfig::default());
        let mut c = EventContext::new(EventEnvelope::new("system.notice", json!({}), Priority::Low));
        assert_eq!(stage.before(&mut c).await.unwrap(), Decision::Continue);

        let counters = stage.counters.lock();
        assert!(counters.recipients.is_empty());
        assert_eq!(counters.global.count, 1);
    }
}
