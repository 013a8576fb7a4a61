//! 事件处理器注册表
//!
//! 维护事件名（精确或通配）到处理器列表的映射。
//!
//! - 精确订阅按事件名分桶，通配订阅单独存放，查找时合并
//! - 返回顺序：优先级降序，同优先级保持注册顺序（跨精确/通配两类也成立）
//! - `once` 订阅在执行前通过 [`EventRegistry::claim`] 原子摘除，保证只执行一次
//!
//! 注册表不对重复注册去重，调用方需自行避免重复初始化。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::events::{EventEnvelope, EventPattern};

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理一个事件，返回错误会中止同步执行链上的后续处理器
    async fn handle(&self, event: &EventEnvelope) -> Result<()>;

    /// 处理器名称，用于日志和错误样本
    fn name(&self) -> &str;
}

/// 闭包处理器适配
struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        (self.func)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 用闭包构造处理器
///
/// ```ignore
/// let handler = handler_fn("audit", |event| async move {
///     tracing::info!(event = %event.event_name, "收到事件");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        func,
    })
}

/// 注册选项
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// 数值越大越先执行
    pub priority: i32,
    /// 首次执行后自动注销
    pub once: bool,
}

impl RegisterOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// 一条处理器注册
#[derive(Clone)]
pub struct HandlerRegistration {
    pub id: u64,
    pub pattern: String,
    pub handler: Arc<dyn EventHandler>,
    pub priority: i32,
    pub once: bool,
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("handler", &self.handler.name())
            .field("priority", &self.priority)
            .field("once", &self.once)
            .finish()
    }
}

/// 注册表统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub event_count: usize,
    pub handler_count: usize,
    pub wildcard_count: usize,
    pub once_count: usize,
    pub handlers_per_event: BTreeMap<String, usize>,
}

#[derive(Default)]
struct RegistryState {
    exact: HashMap<String, Vec<HandlerRegistration>>,
    wildcards: Vec<(EventPattern, HandlerRegistration)>,
}

impl RegistryState {
    fn remove_where(&mut self, pred: impl Fn(&HandlerRegistration) -> bool) -> usize {
        let mut removed = 0;
        self.exact.retain(|_, regs| {
            let before = regs.len();
            regs.retain(|r| !pred(r));
            removed += before - regs.len();
            !regs.is_empty()
        });
        let before = self.wildcards.len();
        self.wildcards.retain(|(_, r)| !pred(r));
        removed + before - self.wildcards.len()
    }
}

/// 事件处理器注册表
///
/// 克隆开销很小，所有克隆共享同一份状态
#[derive(Clone, Default)]
pub struct EventRegistry {
    state: Arc<RwLock<RegistryState>>,
    next_id: Arc<AtomicU64>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，返回可用于注销的订阅句柄
    pub fn register(
        &self,
        pattern: impl AsRef<str>,
        handler: Arc<dyn EventHandler>,
        options: RegisterOptions,
    ) -> Result<Subscription> {
        let pattern = EventPattern::parse(pattern.as_ref())?;
        // id 单调递增，同时充当注册顺序
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(
            pattern = %pattern.as_str(),
            handler = %handler.name(),
            priority = options.priority,
            once = options.once,
            "注册事件处理器"
        );

        let registration = HandlerRegistration {
            id,
            pattern: pattern.as_str().to_string(),
            handler,
            priority: options.priority,
            once: options.once,
        };

        let mut state = self.state.write();
        match pattern {
            EventPattern::Exact(name) => state.exact.entry(name).or_default().push(registration),
            wildcard @ EventPattern::Wildcard { .. } => state.wildcards.push((wildcard, registration)),
        }
        drop(state);

        Ok(Subscription {
            id,
            registry: self.clone(),
        })
    }

    /// 解析事件的全部处理器（精确 + 匹配的通配），按优先级降序
    pub fn get_handlers(&self, event_name: &str) -> Vec<HandlerRegistration> {
        let state = self.state.read();
        let mut handlers: Vec<HandlerRegistration> = state
            .exact
            .get(event_name)
            .map(|regs| regs.to_vec())
            .unwrap_or_default();
        handlers.extend(
            state
                .wildcards
                .iter()
                .filter(|(pattern, _)| pattern.matches(event_name))
                .map(|(_, reg)| reg.clone()),
        );
        drop(state);

        handlers.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        handlers
    }

    pub fn has_handlers(&self, event_name: &str) -> bool {
        let state = self.state.read();
        state.exact.get(event_name).is_some_and(|regs| !regs.is_empty())
            || state.wildcards.iter().any(|(p, _)| p.matches(event_name))
    }

    /// 摘除一条 once 注册；返回 false 表示已被其他执行方摘除
    pub fn claim(&self, registration_id: u64) -> bool {
        self.state.write().remove_where(|r| r.id == registration_id) > 0
    }

    /// 按处理器引用注销，返回移除的注册数
    pub fn unregister(&self, pattern: &str, handler: &Arc<dyn EventHandler>) -> usize {
        let target = Arc::as_ptr(handler) as *const ();
        let removed = self
            .state
            .write()
            .remove_where(|r| r.pattern == pattern && Arc::as_ptr(&r.handler) as *const () == target);
        if removed > 0 {
            debug!(pattern = %pattern, handler = %handler.name(), removed, "注销事件处理器");
        }
        removed
    }

    fn unregister_id(&self, registration_id: u64) -> bool {
        self.state.write().remove_where(|r| r.id == registration_id) > 0
    }

    /// 已注册的事件名与通配模式（排序后）
    pub fn list_events(&self) -> Vec<String> {
        let state = self.state.read();
        let mut events: Vec<String> = state.exact.keys().cloned().collect();
        for (pattern, _) in &state.wildcards {
            if !events.iter().any(|e| e == pattern.as_str()) {
                events.push(pattern.as_str().to_string());
            }
        }
        events.sort();
        events
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let mut stats = RegistryStats::default();

        for (event, regs) in &state.exact {
            stats.handler_count += regs.len();
            stats.once_count += regs.iter().filter(|r| r.once).count();
            stats.handlers_per_event.insert(event.clone(), regs.len());
        }
        for (pattern, reg) in &state.wildcards {
            stats.handler_count += 1;
            stats.wildcard_count += 1;
            if reg.once {
                stats.once_count += 1;
            }
            *stats
                .handlers_per_event
                .entry(pattern.as_str().to_string())
                .or_default() += 1;
        }
        stats.event_count = stats.handlers_per_event.len();
        stats
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.exact.clear();
        state.wildcards.clear();
    }
}

/// 订阅句柄
///
/// 丢弃句柄不会注销，需显式调用 [`Subscription::unsubscribe`]
#[must_use = "丢弃句柄后将无法注销该订阅"]
pub struct Subscription {
    id: u64,
    registry: EventRegistry,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 注销订阅；已被注销（或 once 已执行）时返回 false
    pub fn unsubscribe(self) -> bool {
        self.registry.unregister_id(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Arc<dyn EventHandler> {
        handler_fn(name.to_string(), |_event| async { Ok(()) })
    }

    fn names(handlers: &[HandlerRegistration]) -> Vec<String> {
        handlers.iter().map(|h| h.handler.name().to_string()).collect()
    }

    #[test]
    fn test_priority_order_and_stable_ties() {
        let registry = EventRegistry::new();
        let opts = RegisterOptions::default();
        let _a = registry.register("order.created", noop("a"), opts).unwrap();
        let _b = registry.register("order.created", noop("b"), opts.with_priority(10)).unwrap();
        let _c = registry.register("order.created", noop("c"), opts).unwrap();
        let _d = registry.register("order.created", noop("d"), opts.with_priority(-5)).unwrap();

        let handlers = registry.get_handlers("order.created");
        assert_eq!(names(&handlers), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn test_wildcard_matches_retroactively() {
        let registry = EventRegistry::new();
        let _exact = registry
            .register("order.created", noop("exact"), RegisterOptions::default())
            .unwrap();
        let _wild = registry
            .register("order.*", noop("wild"), RegisterOptions::default())
            .unwrap();

        assert_eq!(names(&registry.get_handlers("order.created")), vec!["exact", "wild"]);
        assert_eq!(names(&registry.get_handlers("order.shipped")), vec!["wild"]);
        assert!(registry.get_handlers("payment.confirmed").is_empty());
        assert!(registry.has_handlers("order.refunded"));
        assert!(!registry.has_handlers("payment.confirmed"));
    }

    #[test]
    fn test_wildcard_and_exact_interleave_by_priority() {
        let registry = EventRegistry::new();
        let opts = RegisterOptions::default();
        let _w = registry.register("order.*", noop("wild"), opts.with_priority(5)).unwrap();
        let _e = registry.register("order.created", noop("exact"), opts.with_priority(5)).unwrap();
        let _h = registry.register("order.created", noop("high"), opts.with_priority(9)).unwrap();

        assert_eq!(
            names(&registry.get_handlers("order.created")),
            vec!["high", "wild", "exact"]
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let registry = EventRegistry::new();
        let result = registry.register("order.*.*", noop("x"), RegisterOptions::default());
        assert!(result.is_err());
        assert_eq!(registry.stats().handler_count, 0);
    }

    #[test]
    fn test_subscription_unsubscribe() {
        let registry = EventRegistry::new();
        let sub = registry
            .register("order.created", noop("a"), RegisterOptions::default())
            .unwrap();
        assert!(registry.has_handlers("order.created"));

        assert!(sub.unsubscribe());
        assert!(!registry.has_handlers("order.created"));
        assert!(registry.list_events().is_empty());
    }

    #[test]
    fn test_unregister_by_handler_reference() {
        let registry = EventRegistry::new();
        let shared = noop("shared");
        let _a = registry
            .register("order.created", shared.clone(), RegisterOptions::default())
            .unwrap();
        let _b = registry
            .register("order.created", noop("other"), RegisterOptions::default())
            .unwrap();

        assert_eq!(registry.unregister("order.created", &shared), 1);
        assert_eq!(names(&registry.get_handlers("order.created")), vec!["other"]);
        assert_eq!(registry.unregister("order.created", &shared), 0);
    }

    #[test]
    fn test_claim_once_registration() {
        let registry = EventRegistry::new();
        let sub = registry
            .register("user.registered", noop("welcome"), RegisterOptions::default().once())
            .unwrap();

        assert!(registry.claim(sub.id()));
        assert!(!registry.claim(sub.id()));
        assert!(registry.get_handlers("user.registered").is_empty());
    }

    #[test]
    fn test_stats_and_list_events() {
        let registry = EventRegistry::new();
        let opts = RegisterOptions::default();
        let _a = registry.register("order.created", noop("a"), opts).unwrap();
        let _b = registry.register("order.created", noop("b"), opts.once()).unwrap();
        let _c = registry.register("payment.*", noop("c"), opts).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.handler_count, 3);
        assert_eq!(stats.wildcard_count, 1);
        assert_eq!(stats.once_count, 1);
        assert_eq!(stats.handlers_per_event.get("order.created"), Some(&2));
        assert_eq!(registry.list_events(), vec!["order.created", "payment.*"]);

        registry.clear();
        assert_eq!(registry.stats().handler_count, 0);
    }
}
