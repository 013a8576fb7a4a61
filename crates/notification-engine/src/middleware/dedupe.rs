//! 去重阶段
//!
//! 同一（事件, 接收人, 实体）在窗口内只投递一次，窗口从首次出现开始计算，
//! 被抑制的重复事件不会延长窗口。旁路名单中的事件总是投递。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use notify_shared::config::DedupeConfig;
use tokio::time::Instant;
use tracing::debug;

use super::{Decision, EventContext, Middleware};
use crate::error::Result;

/// 每处理多少次事件清理一次过期键
const PRUNE_EVERY: u64 = 256;

pub struct DedupeMiddleware {
    window: Duration,
    bypass: HashSet<String>,
    seen: DashMap<String, Instant>,
    calls: AtomicU64,
}

impl DedupeMiddleware {
    pub fn new(config: &DedupeConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            bypass: config.bypass_events.iter().cloned().collect(),
            seen: DashMap::new(),
            calls: AtomicU64::new(0),
        }
    }

    fn dedupe_key(ctx: &EventContext) -> String {
        format!(
            "{}|{}|{}",
            ctx.event_name(),
            ctx.recipient().unwrap_or("*"),
            ctx.envelope.entity_key()
        )
    }

    /// 清理过期键，返回清理数
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        before - self.seen.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.seen.len()
    }
}

#[async_trait]
impl Middleware for DedupeMiddleware {
    fn name(&self) -> &str {
        "dedupe"
    }

    async fn before(&self, ctx: &mut EventContext) -> Result<Decision> {
        if self.bypass.contains(ctx.event_name()) {
            return Ok(Decision::Continue);
        }

        if self.calls.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }

        let key = Self::dedupe_key(ctx);
        let now = Instant::now();
        let duplicate = match self.seen.entry(key) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.window {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        };

        if duplicate {
            debug!(event = %ctx.event_name(), recipient = ?ctx.recipient(), "窗口内重复事件，已抑制");
            return Ok(ctx.skip("duplicate"));
        }
        Ok(Decision::Continue)
    }
}
